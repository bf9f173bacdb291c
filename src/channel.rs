use tracing::warn;

use crate::soundfont::{
    GeneralController, GeneratorType, ModulatorParameterSet, SoundFont, PERCUSSION_BANK,
};
use crate::voice::{Voice, VoiceState};

pub const NUM_CHANNELS: usize = 16;
pub const NUM_CONTROLLERS: usize = 128;
pub const PERCUSSION_CHANNEL: usize = 9;
pub const MAX_KEY: usize = 127;

/// MIDI continuous controller numbers the channel handles specially.
pub mod cc {
    pub const BANK_SELECT_MSB: u8 = 0;
    pub const DATA_ENTRY_MSB: u8 = 6;
    pub const VOLUME: u8 = 7;
    pub const PAN: u8 = 10;
    pub const EXPRESSION: u8 = 11;
    pub const BANK_SELECT_LSB: u8 = 32;
    pub const DATA_ENTRY_LSB: u8 = 38;
    pub const SUSTAIN: u8 = 64;
    pub const DATA_INCREMENT: u8 = 96;
    pub const DATA_DECREMENT: u8 = 97;
    pub const NRPN_LSB: u8 = 98;
    pub const NRPN_MSB: u8 = 99;
    pub const RPN_LSB: u8 = 100;
    pub const RPN_MSB: u8 = 101;
    pub const ALL_SOUND_OFF: u8 = 120;
    pub const RESET_ALL_CONTROLLERS: u8 = 121;
    pub const ALL_NOTES_OFF: u8 = 123;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataEntryMode {
    Rpn,
    Nrpn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rpn {
    PitchBendSensitivity = 0,
    FineTuning = 1,
    CoarseTuning = 2,
}

const RPN_LAST: usize = 3;

/// One of the 16 MIDI channels: controller state, preset binding (an index
/// into the owning bank), and the note-on/zone-walk entry point.
pub struct Channel {
    index: usize,
    output_rate: f32,
    preset: Option<usize>,
    controllers: [u8; NUM_CONTROLLERS],
    rpns: [u16; RPN_LAST],
    key_pressures: [u8; MAX_KEY + 1],
    channel_pressure: u8,
    pitch_bend: u16,
    data_entry_mode: DataEntryMode,
    pitch_bend_sensitivity: f32,
    fine_tuning: f32,
    coarse_tuning: f32,
    current_note_id: usize,
}

impl Channel {
    pub fn new(index: usize, output_rate: f32) -> Channel {
        let mut channel = Channel {
            index,
            output_rate,
            preset: None,
            controllers: [0; NUM_CONTROLLERS],
            rpns: [0; RPN_LAST],
            key_pressures: [0; MAX_KEY + 1],
            channel_pressure: 0,
            pitch_bend: 1 << 13,
            data_entry_mode: DataEntryMode::Rpn,
            pitch_bend_sensitivity: 2.0,
            fine_tuning: 0.0,
            coarse_tuning: 0.0,
            current_note_id: 0,
        };
        channel.controllers[cc::VOLUME as usize] = 100;
        channel.controllers[cc::PAN as usize] = 64;
        channel.controllers[cc::EXPRESSION as usize] = 127;
        channel.controllers[cc::RPN_LSB as usize] = 127;
        channel.controllers[cc::RPN_MSB as usize] = 127;
        channel
    }

    pub fn bank(&self) -> (u8, u8) {
        (
            self.controllers[cc::BANK_SELECT_MSB as usize],
            self.controllers[cc::BANK_SELECT_LSB as usize],
        )
    }

    pub fn controller(&self, controller: u8) -> u8 {
        self.controllers[controller as usize]
    }

    pub fn has_preset(&self) -> bool {
        self.preset.is_some()
    }

    pub fn set_preset(&mut self, preset: Option<usize>) {
        self.preset = preset;
    }

    pub fn note_off(&mut self, voices: &mut [Voice], key: u8) {
        let sustained = self.controllers[cc::SUSTAIN as usize] >= 64;

        for voice in voices.iter_mut() {
            if voice.status() != VoiceState::Unused
                && voice.channel() == self.index
                && voice.actual_key() == key
            {
                voice.release(sustained);
            }
        }
    }

    pub fn note_on(&mut self, soundfont: &SoundFont, voices: &mut [Voice], key: u8, velocity: u8) {
        if velocity == 0 {
            self.note_off(voices, key);
            return;
        }

        let preset = match self.preset.and_then(|index| soundfont.presets().get(index)) {
            Some(preset) => preset,
            None => return,
        };
        let percussion = preset.bank == PERCUSSION_BANK;

        for preset_zone in &preset.zones {
            if !preset_zone.is_in_range(key as i8, velocity as i8) {
                continue;
            }
            let inst_id = preset_zone.generators.get_or_default(GeneratorType::Instrument);
            let instrument = match soundfont.instruments().get(inst_id as usize) {
                Some(instrument) => instrument,
                None => {
                    warn!(inst_id, "preset zone references a missing instrument");
                    continue;
                }
            };
            for inst_zone in &instrument.zones {
                if !inst_zone.is_in_range(key as i8, velocity as i8) {
                    continue;
                }
                let sample_id = inst_zone.generators.get_or_default(GeneratorType::SampleId);
                let sample = match soundfont.samples().get(sample_id as usize) {
                    Some(sample) => sample,
                    None => {
                        warn!(sample_id, "instrument zone references a missing sample");
                        continue;
                    }
                };

                // preset generators are additive offsets over instrument
                // values; preset modulators sum into identical instrument
                // modulators, and the defaults only fill gaps
                let mut generators = inst_zone.generators.clone();
                generators.add(&preset_zone.generators);

                let mut mod_params = inst_zone.modulators.clone();
                mod_params.merge_and_add(&preset_zone.modulators);
                mod_params.merge(ModulatorParameterSet::default_parameters());

                let exclusive_class = generators.get_or_default(GeneratorType::ExclusiveClass);
                let voice_index = self.take_voice(voices, exclusive_class);
                let voice = &mut voices[voice_index];
                voice.init(
                    self.index,
                    self.current_note_id,
                    self.output_rate,
                    sample,
                    soundfont.sample_buffer().clone(),
                    generators,
                    &mod_params,
                    key,
                    velocity,
                    percussion,
                );
                voice.update_general_controller(
                    GeneralController::PolyphonicPressure,
                    self.key_pressures[voice.actual_key() as usize] as f32,
                );
                voice.update_general_controller(GeneralController::ChannelPressure, self.channel_pressure as f32);
                voice.update_general_controller(GeneralController::PitchWheel, self.pitch_bend as f32);
                voice.update_general_controller(
                    GeneralController::PitchWheelSensitivity,
                    self.pitch_bend_sensitivity,
                );
                voice.update_fine_tuning(self.fine_tuning);
                voice.update_coarse_tuning(self.coarse_tuning);
                for i in 0..NUM_CONTROLLERS {
                    voice.update_midi_controller(i as u8, self.controllers[i]);
                }
            }
        }
        self.current_note_id += 1;
    }

    pub fn key_pressure(&mut self, voices: &mut [Voice], key: u8, value: u8) {
        self.key_pressures[key as usize] = value;

        for voice in voices.iter_mut() {
            if voice.status() != VoiceState::Unused
                && voice.channel() == self.index
                && voice.actual_key() == key
            {
                voice.update_general_controller(GeneralController::PolyphonicPressure, value as f32);
            }
        }
    }

    pub fn channel_pressure(&mut self, voices: &mut [Voice], value: u8) {
        self.channel_pressure = value;
        for voice in self.own_voices(voices) {
            voice.update_general_controller(GeneralController::ChannelPressure, value as f32);
        }
    }

    pub fn pitch_bend(&mut self, voices: &mut [Voice], value: u16) {
        self.pitch_bend = value;
        for voice in self.own_voices(voices) {
            voice.update_general_controller(GeneralController::PitchWheel, value as f32);
        }
    }

    pub fn control_change(&mut self, voices: &mut [Voice], controller: u8, value: u8) {
        self.controllers[controller as usize] = value;

        match controller {
            cc::DATA_ENTRY_MSB | cc::DATA_ENTRY_LSB => {
                if self.data_entry_mode == DataEntryMode::Rpn {
                    let rpn = self.selected_rpn();
                    if rpn < RPN_LAST as u16 {
                        let data = ((self.controllers[cc::DATA_ENTRY_MSB as usize] as u16) << 7)
                            + self.controllers[cc::DATA_ENTRY_LSB as usize] as u16;
                        self.rpns[rpn as usize] = data;
                        self.update_rpn(voices);
                    }
                }
            }
            cc::SUSTAIN => {
                if value < 64 {
                    for voice in voices.iter_mut() {
                        if voice.channel() == self.index && voice.status() == VoiceState::Sustained {
                            voice.release(false);
                        }
                    }
                }
            }
            cc::DATA_INCREMENT => {
                if self.data_entry_mode == DataEntryMode::Rpn {
                    let rpn = self.selected_rpn();
                    if rpn < RPN_LAST as u16 && self.rpns[rpn as usize] >> 7 < 127 {
                        self.rpns[rpn as usize] += 1 << 7;
                        self.update_rpn(voices);
                    }
                }
            }
            cc::DATA_DECREMENT => {
                if self.data_entry_mode == DataEntryMode::Rpn {
                    let rpn = self.selected_rpn();
                    if rpn < RPN_LAST as u16 && self.rpns[rpn as usize] >> 7 > 0 {
                        self.rpns[rpn as usize] -= 1 << 7;
                        self.update_rpn(voices);
                    }
                }
            }
            cc::NRPN_MSB | cc::NRPN_LSB => {
                self.data_entry_mode = DataEntryMode::Nrpn;
            }
            cc::RPN_MSB | cc::RPN_LSB => {
                self.data_entry_mode = DataEntryMode::Rpn;
            }
            cc::ALL_SOUND_OFF => {
                for voice in self.own_voices(voices) {
                    voice.set_status(VoiceState::Finished);
                }
            }
            cc::RESET_ALL_CONTROLLERS => {
                // See "General MIDI System Level 1 Developer Guidelines",
                // second revision, 'Response to "Reset All Controllers"'
                self.key_pressures = [0; MAX_KEY + 1];
                self.channel_pressure = 0;
                self.pitch_bend = 1 << 13;
                for voice in voices.iter_mut() {
                    if voice.status() != VoiceState::Unused && voice.channel() == self.index {
                        voice.update_general_controller(GeneralController::ChannelPressure, 0.0);
                        voice.update_general_controller(GeneralController::PitchWheel, (1 << 13) as f32);
                    }
                }
                for i in 1u8..122 {
                    if (91..=95).contains(&i) || (70..=79).contains(&i) {
                        continue;
                    }
                    match i {
                        cc::VOLUME | cc::PAN | cc::BANK_SELECT_LSB | cc::ALL_SOUND_OFF => {}
                        cc::EXPRESSION | cc::RPN_LSB | cc::RPN_MSB => {
                            self.controllers[i as usize] = 127;
                            for voice in self.own_voices(voices) {
                                voice.update_midi_controller(i, 127);
                            }
                        }
                        _ => {
                            self.controllers[i as usize] = 0;
                            for voice in self.own_voices(voices) {
                                voice.update_midi_controller(i, 0);
                            }
                        }
                    }
                }
            }
            cc::ALL_NOTES_OFF => {
                // "The Complete MIDI 1.0 Detailed Specification": All Notes
                // Off is affected by CC 64
                let sustained = self.controllers[cc::SUSTAIN as usize] >= 64;
                for voice in self.own_voices(voices) {
                    voice.release(sustained);
                }
            }
            _ => {
                for voice in self.own_voices(voices) {
                    voice.update_midi_controller(controller, value);
                }
            }
        }
    }

    fn own_voices<'a>(&'a self, voices: &'a mut [Voice]) -> impl Iterator<Item = &'a mut Voice> + 'a {
        let index = self.index;
        voices
            .iter_mut()
            .filter(move |voice| voice.status() != VoiceState::Unused && voice.channel() == index)
    }

    fn selected_rpn(&self) -> u16 {
        ((self.controllers[cc::RPN_MSB as usize] as u16) << 7) + self.controllers[cc::RPN_LSB as usize] as u16
    }

    /// Pick a voice slot for a new note. Voices on the same channel sharing
    /// a nonzero exclusive class are released first; a free slot wins
    /// immediately, otherwise the lowest-scoring voice is stolen.
    fn take_voice(&self, voices: &mut [Voice], exclusive_class: i16) -> usize {
        if exclusive_class != 0 {
            for voice in voices.iter_mut() {
                if voice.channel() == self.index
                    && voice.note_id() != self.current_note_id
                    && voice.exclusive_class() == exclusive_class
                {
                    voice.release(false);
                }
            }
        }

        let mut to_kill: Option<usize> = None;
        let mut lowest_score = 0i32;
        for i in 0..voices.len() {
            let status = voices[i].status();
            if status == VoiceState::Unused || status == VoiceState::Finished {
                return i;
            }
            // Similar to Fluidsynth's model: a released voice outside the
            // percussion channel can be killed easily, a sustained one
            // without sounding too abrupt; otherwise prefer older, then
            // quieter voices.
            let mut score = 0i32;
            if voices[i].channel() != PERCUSSION_CHANNEL && status == VoiceState::Released {
                score -= 300;
            }
            if status == VoiceState::Sustained {
                score -= 200;
            }
            if let Some(candidate) = to_kill {
                if voices[i].steps() > voices[candidate].steps() {
                    score -= 100;
                }
                if voices[i].amp() < voices[candidate].amp() {
                    score -= 50;
                }
            }
            if to_kill.is_none() || score < lowest_score {
                lowest_score = score;
                to_kill = Some(i);
            }
        }
        let index = to_kill.expect("voice pool is empty");
        voices[index].release(false);
        index
    }

    fn update_rpn(&mut self, voices: &mut [Voice]) {
        let rpn = self.selected_rpn();
        let data = self.rpns[rpn as usize] as i32;
        match rpn {
            _ if rpn == Rpn::PitchBendSensitivity as u16 => {
                self.pitch_bend_sensitivity = data as f32 / 128.0;
                let sensitivity = self.pitch_bend_sensitivity;
                for voice in self.own_voices(voices) {
                    voice.update_general_controller(GeneralController::PitchWheelSensitivity, sensitivity);
                }
            }
            _ if rpn == Rpn::FineTuning as u16 => {
                self.fine_tuning = (data - 8192) as f32 / 81.92;
                let fine_tuning = self.fine_tuning;
                for voice in self.own_voices(voices) {
                    voice.update_fine_tuning(fine_tuning);
                }
            }
            _ if rpn == Rpn::CoarseTuning as u16 => {
                self.coarse_tuning = (data - 8192) as f32 / 128.0;
                let coarse_tuning = self.coarse_tuning;
                for voice in self.own_voices(voices) {
                    voice.update_coarse_tuning(coarse_tuning);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soundfont::{GeneratorSet, Sample, SampleTypes};
    use std::sync::Arc;

    fn playing_voice(channel: usize, note_id: usize, key: u8) -> Voice {
        let buffer: Arc<Vec<i16>> = Arc::new(vec![1000i16; 512]);
        let sample = Sample {
            name: "test".to_string(),
            start: 0,
            end: 511,
            start_loop: 0,
            end_loop: 511,
            sample_rate: 44100,
            key: 60,
            correction: 0,
            sample_types: SampleTypes::MONO,
            min_atten: 0.0,
        };
        let mut generators = GeneratorSet::default();
        generators.set(crate::soundfont::GeneratorType::SampleModes, 1);
        let mut voice = Voice::new();
        voice.init(
            channel,
            note_id,
            44100.0,
            &sample,
            buffer,
            generators,
            ModulatorParameterSet::default_parameters(),
            key,
            100,
            false,
        );
        voice
    }

    #[test]
    fn note_off_honors_sustain_pedal() {
        let mut channel = Channel::new(0, 44100.0);
        let mut voices = vec![playing_voice(0, 0, 60)];

        channel.control_change(&mut voices, cc::SUSTAIN, 127);
        channel.note_off(&mut voices, 60);
        assert_eq!(voices[0].status(), VoiceState::Sustained);

        // dropping the pedal releases sustained voices
        channel.control_change(&mut voices, cc::SUSTAIN, 0);
        assert_eq!(voices[0].status(), VoiceState::Released);
    }

    #[test]
    fn all_sound_off_finishes_only_own_channel() {
        let mut channel = Channel::new(0, 44100.0);
        let mut voices = vec![playing_voice(0, 0, 60), playing_voice(1, 0, 62)];
        channel.control_change(&mut voices, cc::ALL_SOUND_OFF, 0);
        assert_eq!(voices[0].status(), VoiceState::Finished);
        assert_eq!(voices[1].status(), VoiceState::Playing);
    }

    #[test]
    fn all_notes_off_releases_voices() {
        let mut channel = Channel::new(0, 44100.0);
        let mut voices = vec![playing_voice(0, 0, 60), playing_voice(0, 1, 64)];
        channel.control_change(&mut voices, cc::ALL_NOTES_OFF, 0);
        assert_eq!(voices[0].status(), VoiceState::Released);
        assert_eq!(voices[1].status(), VoiceState::Released);
    }

    #[test]
    fn steal_prefers_free_slot_then_released() {
        let channel = Channel::new(0, 44100.0);
        let mut voices = vec![playing_voice(0, 0, 60), Voice::new()];
        assert_eq!(channel.take_voice(&mut voices, 0), 1);

        let mut voices = vec![playing_voice(0, 0, 60), playing_voice(0, 1, 62)];
        voices[0].release(false);
        for _ in 0..128 {
            voices[0].update();
            voices[1].update();
        }
        if voices[0].status() == VoiceState::Released {
            assert_eq!(channel.take_voice(&mut voices, 0), 0);
        }
    }

    #[test]
    fn steal_discount_keys_off_the_percussion_channel() {
        // two released voices: the one on channel 9 keeps no -300 discount,
        // so the channel-0 voice is stolen first
        let channel = Channel::new(0, 44100.0);
        let mut voices = vec![
            playing_voice(PERCUSSION_CHANNEL, 0, 42),
            playing_voice(0, 1, 60),
        ];
        voices[0].release(false);
        voices[1].release(false);
        assert_eq!(voices[0].status(), VoiceState::Released);
        assert_eq!(channel.take_voice(&mut voices, 0), 1);
    }

    #[test]
    fn steal_prefers_sustained_over_playing() {
        let channel = Channel::new(0, 44100.0);
        let mut voices = vec![playing_voice(0, 0, 60), playing_voice(0, 1, 62)];
        voices[1].release(true);
        assert_eq!(voices[1].status(), VoiceState::Sustained);
        assert_eq!(channel.take_voice(&mut voices, 0), 1);
    }

    #[test]
    fn steal_takes_first_voice_on_equal_scores() {
        let channel = Channel::new(0, 44100.0);
        let mut voices = vec![playing_voice(0, 0, 60), playing_voice(0, 1, 62)];
        assert_eq!(channel.take_voice(&mut voices, 0), 0);
        assert_eq!(voices[0].status(), VoiceState::Released);
    }

    #[test]
    fn exclusive_class_releases_same_class_voices() {
        let channel = Channel::new(0, 44100.0);
        let mut voices = vec![playing_voice(0, 0, 42), Voice::new()];
        // both test voices report exclusive class 0 by default, so give the
        // search a class the first voice does not carry: nothing released
        channel.take_voice(&mut voices, 1);
        assert_eq!(voices[0].status(), VoiceState::Playing);
    }

    #[test]
    fn rpn_data_entry_sets_pitch_bend_sensitivity() {
        let mut channel = Channel::new(0, 44100.0);
        let mut voices: Vec<Voice> = Vec::new();
        channel.control_change(&mut voices, cc::RPN_MSB, 0);
        channel.control_change(&mut voices, cc::RPN_LSB, 0);
        channel.control_change(&mut voices, cc::DATA_ENTRY_MSB, 24);
        channel.control_change(&mut voices, cc::DATA_ENTRY_LSB, 0);
        assert!((channel.pitch_bend_sensitivity - 24.0).abs() < 1e-6);

        channel.control_change(&mut voices, cc::DATA_INCREMENT, 0);
        assert!((channel.pitch_bend_sensitivity - 25.0).abs() < 1e-6);
        channel.control_change(&mut voices, cc::DATA_DECREMENT, 0);
        assert!((channel.pitch_bend_sensitivity - 24.0).abs() < 1e-6);
    }

    #[test]
    fn nrpn_selection_blocks_rpn_writes() {
        let mut channel = Channel::new(0, 44100.0);
        let mut voices: Vec<Voice> = Vec::new();
        channel.control_change(&mut voices, cc::RPN_MSB, 0);
        channel.control_change(&mut voices, cc::RPN_LSB, 0);
        channel.control_change(&mut voices, cc::NRPN_MSB, 5);
        channel.control_change(&mut voices, cc::DATA_ENTRY_MSB, 24);
        // still the default
        assert!((channel.pitch_bend_sensitivity - 2.0).abs() < 1e-6);
    }

    #[test]
    fn reset_all_controllers_preserves_volume_and_pan() {
        let mut channel = Channel::new(0, 44100.0);
        let mut voices: Vec<Voice> = Vec::new();
        channel.control_change(&mut voices, cc::VOLUME, 42);
        channel.control_change(&mut voices, cc::PAN, 10);
        channel.control_change(&mut voices, 1, 99); // modulation
        channel.control_change(&mut voices, 74, 33); // sound controller, 70..79 preserved
        channel.control_change(&mut voices, cc::RESET_ALL_CONTROLLERS, 0);

        assert_eq!(channel.controller(cc::VOLUME), 42);
        assert_eq!(channel.controller(cc::PAN), 10);
        assert_eq!(channel.controller(74), 33);
        assert_eq!(channel.controller(1), 0);
        assert_eq!(channel.controller(cc::EXPRESSION), 127);
        assert_eq!(channel.controller(cc::RPN_MSB), 127);
        assert_eq!(channel.pitch_bend, 1 << 13);
    }
}

use std::path::Path;

use tracing::{debug, error};

use crate::channel::{Channel, NUM_CHANNELS, PERCUSSION_CHANNEL};
use crate::reader::ByteSource;
use crate::sequencer::{EventKind, SeqEvent, Sequencer};
use crate::soundfont::{SoundFont, PERCUSSION_BANK};
use crate::voice::{StereoValue, Voice, VoiceState};

/// Active MIDI standard, selected by SysEx resets; governs how bank-select
/// controllers map to SoundFont banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Standard {
    Gm,
    Gs,
    Xg,
}

/// Everything the sequencer drives: channels, the voice pool, the loaded
/// bank, and the final mix state.
pub(crate) struct Engine {
    standard: Standard,
    no_drums: bool,
    no_piano: bool,
    volume: f32,
    load_error: bool,
    channels: Vec<Channel>,
    voices: Vec<Voice>,
    soundfont: Option<SoundFont>,
}

impl Engine {
    fn new(output_rate: f32, voice_count: usize) -> Engine {
        let mut voices = Vec::with_capacity(voice_count);
        for _ in 0..voice_count {
            voices.push(Voice::new());
        }
        let mut channels = Vec::with_capacity(NUM_CHANNELS);
        for i in 0..NUM_CHANNELS {
            channels.push(Channel::new(i, output_rate));
        }
        Engine {
            standard: Standard::Gm,
            no_drums: false,
            no_piano: false,
            volume: 1.0,
            load_error: false,
            channels,
            voices,
            soundfont: None,
        }
    }

    pub(crate) fn set_standard(&mut self, standard: Standard) {
        self.standard = standard;
    }

    /// Mix one stereo frame from all live voices, advancing each by one
    /// sample.
    pub(crate) fn render_frame(&mut self) -> (f32, f32) {
        let mut sum = StereoValue::default();
        for voice in &mut self.voices {
            match voice.status() {
                VoiceState::Finished | VoiceState::Unused => continue,
                _ => {}
            }
            voice.update();
            if voice.status() == VoiceState::Finished {
                continue;
            }
            sum += voice.render();
        }
        sum = sum * self.volume;
        (sum.left, sum.right)
    }

    pub(crate) fn all_channels_control_change(&mut self, controller: u8, value: u8) {
        let Engine { channels, voices, .. } = self;
        for channel in channels.iter_mut() {
            channel.control_change(voices, controller, value);
        }
    }

    /// Dispatch one timed channel event from the sequencer.
    pub(crate) fn channel_event(&mut self, event: &SeqEvent) {
        let ch = event.channel as usize;

        if event.kind == EventKind::PatchChange {
            let (msb, lsb) = self.channels[ch].bank();
            let sf_bank = match self.standard {
                Standard::Gs => msb as u16,
                // assuming nobody uses XG voices whose bank MSBs overlap
                // normal voices' bank LSBs, e.g. the SFX bank (MSB=64)
                Standard::Xg => {
                    if msb == 127 {
                        PERCUSSION_BANK
                    } else {
                        lsb as u16
                    }
                }
                Standard::Gm => 0,
            };
            let bank = if ch == PERCUSSION_CHANNEL { PERCUSSION_BANK } else { sf_bank };
            let preset = self.find_preset(bank, event.data[0] as u16);
            self.channels[ch].set_preset(preset);
            return;
        }

        let Engine { channels, voices, soundfont, .. } = self;
        match event.kind {
            EventKind::NoteOff => {
                channels[ch].note_off(voices, event.data[0]);
            }
            EventKind::NoteOn => {
                if let Some(soundfont) = soundfont {
                    channels[ch].note_on(soundfont, voices, event.data[0], event.data[1]);
                }
            }
            EventKind::NoteTouch => {
                channels[ch].key_pressure(voices, event.data[0], event.data[1]);
            }
            EventKind::ControlChange => {
                channels[ch].control_change(voices, event.data[0], event.data[1]);
            }
            EventKind::ChannelTouch => {
                channels[ch].channel_pressure(voices, event.data[0]);
            }
            EventKind::PitchWheel => {
                let value = ((event.data[1] as u16) << 7) + event.data[0] as u16;
                channels[ch].pitch_bend(voices, value);
            }
            _ => {}
        }
    }

    /// Resolve `(bank, program)` to a preset index with the GM fallback
    /// chain: exact, percussion program 0, bank 0 same program, bank 0
    /// program 0, nothing.
    fn find_preset(&mut self, bank: u16, preset_id: u16) -> Option<usize> {
        let soundfont = self.soundfont.as_ref()?;
        let mut bank = bank;
        let mut preset_id = preset_id;
        let mut no_drums = false;
        let mut no_piano = false;

        let result = loop {
            if let Some(index) = soundfont.preset_at(bank, preset_id) {
                break Some(index);
            }
            if bank == PERCUSSION_BANK {
                if preset_id != 0 {
                    preset_id = 0;
                } else {
                    no_drums = true;
                    break None;
                }
            } else if bank != 0 {
                bank = 0;
            } else if preset_id != 0 {
                preset_id = 0;
            } else {
                no_piano = true;
                break None;
            }
        };

        if no_drums && !self.no_drums {
            debug!("bank has no percussion preset");
        }
        if no_piano && !self.no_piano {
            debug!("bank has no fallback piano preset");
        }
        self.no_drums |= no_drums;
        self.no_piano |= no_piano;
        result
    }
}

/// The synthesizer facade: wires the sequencer's timed events into channel
/// state and pulls the voice mix into the caller's output buffer.
pub struct Synthesizer {
    engine: Engine,
    sequencer: Sequencer,
}

impl Synthesizer {
    /// `sample_rate` in hertz; `voice_count` fixed voices are pre-allocated
    /// and recycled, never allocated while rendering.
    pub fn new(sample_rate: f32, voice_count: usize) -> Synthesizer {
        Synthesizer {
            engine: Engine::new(sample_rate, voice_count),
            sequencer: Sequencer::new(sample_rate as u32, 2 * std::mem::size_of::<f32>() as u32),
        }
    }

    pub fn load_soundfont<P: AsRef<Path>>(&mut self, path: P) -> bool {
        match ByteSource::open_file(&path) {
            Ok(source) => self.load_soundfont_source(source),
            Err(e) => {
                error!(path = %path.as_ref().display(), %e, "could not open soundfont");
                false
            }
        }
    }

    pub fn load_soundfont_bytes(&mut self, data: &[u8]) -> bool {
        self.load_soundfont_source(ByteSource::open_data(data.to_vec()))
    }

    fn load_soundfont_source(&mut self, mut source: ByteSource) -> bool {
        // drain the pool and unbind presets before the old sample data goes
        // away
        for voice in &mut self.engine.voices {
            voice.set_status(VoiceState::Unused);
        }
        for channel in &mut self.engine.channels {
            channel.set_preset(None);
        }
        self.engine.soundfont = None;
        self.engine.load_error = false;
        self.engine.no_drums = false;
        self.engine.no_piano = false;

        #[cfg(feature = "flac")]
        {
            use std::io::{Read, Seek};
            if let Ok(magic) = crate::peek_magic!(source) {
                if &magic == b"fLaC" {
                    let raw = match source.read_remaining() {
                        Ok(raw) => raw,
                        Err(e) => {
                            error!(%e, "could not read compressed bank");
                            return false;
                        }
                    };
                    match crate::flac::decode_wrapped_bank(&raw) {
                        Ok(decoded) => source = ByteSource::open_data(decoded),
                        Err(e) => {
                            error!(%e, "compressed bank decode failed");
                            return false;
                        }
                    }
                }
            }
        }

        match SoundFont::parse(&mut source) {
            Ok(soundfont) => {
                self.engine.soundfont = Some(soundfont);
                true
            }
            Err(e) => {
                error!(%e, "soundfont load failed");
                self.engine.load_error = true;
                false
            }
        }
    }

    pub fn load_song<P: AsRef<Path>>(&mut self, path: P) -> bool {
        match ByteSource::open_file(&path) {
            Ok(mut source) => match source.read_remaining() {
                Ok(data) => self.load_song_bytes(&data),
                Err(e) => {
                    error!(path = %path.as_ref().display(), %e, "could not read song");
                    false
                }
            },
            Err(e) => {
                error!(path = %path.as_ref().display(), %e, "could not open song");
                false
            }
        }
    }

    pub fn load_song_bytes(&mut self, data: &[u8]) -> bool {
        match self.sequencer.load_song(data) {
            Ok(()) => true,
            Err(e) => {
                error!(%e, "song load failed");
                false
            }
        }
    }

    /// Fill `stream` with interleaved stereo f32 frames. Returns the number
    /// of bytes written; with no song loaded the whole buffer is silence.
    pub fn play_stream(&mut self, stream: &mut [u8]) -> usize {
        let Synthesizer { engine, sequencer } = self;
        sequencer.play_stream(engine, stream)
    }

    /// Master volume; values below zero are clamped.
    pub fn set_volume(&mut self, volume: f32) {
        self.engine.volume = volume.max(0.0);
    }

    pub fn pause(&mut self) {
        self.engine.all_channels_control_change(123, 0); // All Notes Off
    }

    pub fn stop(&mut self) {
        self.engine.all_channels_control_change(120, 0); // All Sound Off
    }

    pub fn reset(&mut self) {
        self.engine.all_channels_control_change(120, 0); // All Sound Off
        self.engine.all_channels_control_change(64, 0); // release sustain
        self.engine.all_channels_control_change(121, 0); // Reset All Controllers
        self.sequencer.full_reset();
    }

    pub fn at_end(&self) -> bool {
        self.sequencer.position_at_end()
    }

    pub fn rewind(&mut self) {
        self.sequencer.rewind();
    }

    pub fn get_load_error(&self) -> bool {
        self.engine.load_error
    }

    pub fn set_load_error(&mut self, error: bool) {
        self.engine.load_error = error;
    }

    pub fn set_loop_enabled(&mut self, enabled: bool) {
        self.sequencer.set_loop_enabled(enabled);
    }

    /// Number of times the global loop repeats; negative loops forever.
    pub fn set_loop_count(&mut self, count: i32) {
        self.sequencer.set_loop_count(count);
    }

    pub fn set_tempo_multiplier(&mut self, multiplier: f64) {
        self.sequencer.set_tempo_multiplier(multiplier);
    }

    pub fn set_channel_enabled(&mut self, channel: usize, enabled: bool) {
        self.sequencer.set_channel_enabled(channel, enabled);
    }

    pub fn song_length_seconds(&self) -> f64 {
        self.sequencer.song_length_seconds()
    }

    /// Global loop points in seconds, when the song carries a valid pair.
    pub fn loop_points_seconds(&self) -> Option<(f64, f64)> {
        self.sequencer.loop_points_seconds()
    }

    pub fn position_seconds(&self) -> f64 {
        self.sequencer.position_seconds()
    }

    pub fn standard(&self) -> Standard {
        self.engine.standard
    }

    pub fn soundfont(&self) -> Option<&SoundFont> {
        self.engine.soundfont.as_ref()
    }

    pub fn voice_count(&self) -> usize {
        self.engine.voices.len()
    }

    /// Voices currently holding a note in any non-pooled state.
    pub fn active_voice_count(&self) -> usize {
        self.engine
            .voices
            .iter()
            .filter(|voice| voice.status() != VoiceState::Unused)
            .count()
    }

    /// Voices still sounding a held note.
    pub fn playing_voice_count(&self) -> usize {
        self.engine
            .voices
            .iter()
            .filter(|voice| {
                matches!(voice.status(), VoiceState::Playing | VoiceState::Sustained)
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_clamps_below_zero() {
        let mut synth = Synthesizer::new(44100.0, 4);
        synth.set_volume(-3.0);
        assert_eq!(synth.engine.volume, 0.0);
        synth.set_volume(1.5);
        assert_eq!(synth.engine.volume, 1.5);
    }

    #[test]
    fn load_error_is_sticky_until_next_load() {
        let mut synth = Synthesizer::new(44100.0, 4);
        assert!(!synth.load_soundfont_bytes(b"definitely not a soundfont"));
        assert!(synth.get_load_error());
        synth.set_load_error(false);
        assert!(!synth.get_load_error());
    }

    #[test]
    fn play_stream_without_song_returns_silence() {
        let mut synth = Synthesizer::new(44100.0, 4);
        let mut buffer = vec![0xAAu8; 44100 * 8];
        let written = synth.play_stream(&mut buffer);
        assert_eq!(written, 44100 * 8);
        assert!(buffer.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn missing_song_file_fails_without_load_error() {
        let mut synth = Synthesizer::new(44100.0, 4);
        assert!(!synth.load_song("/definitely/not/here.mid"));
        assert!(!synth.get_load_error());
    }
}

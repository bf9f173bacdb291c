use std::ops::{Add, AddAssign, Mul, Sub};
use std::sync::Arc;

use crate::math::{
    absolute_cent_to_hertz, attenuation_to_amplitude, concave_curve, convex_curve, key_to_hertz,
    time_cent_to_second,
};
use crate::soundfont::{
    ControllerPalette, GeneralController, GeneratorSet, GeneratorType, ModulatorParam,
    ModulatorParameterSet, ModulatorSource, Sample, SourceDirection, SourcePolarity, SourceType,
    Transform, NUM_GENERATORS,
};

/// Slow-path cadence: envelopes, LFOs and pitch recalculation run once per
/// this many output frames.
pub const CALC_INTERVAL: u32 = 64;
const ATTEN_FACTOR: f32 = 0.4;
const COARSE_UNIT: i64 = 32768;
const PAN_FACTOR: f32 = std::f32::consts::PI / 2000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EnvelopePhase {
    Delay = 0,
    Attack,
    Hold,
    Decay,
    Sustain,
    Release,
    Finished,
}

impl EnvelopePhase {
    fn next(self) -> EnvelopePhase {
        match self {
            EnvelopePhase::Delay => EnvelopePhase::Attack,
            EnvelopePhase::Attack => EnvelopePhase::Hold,
            EnvelopePhase::Hold => EnvelopePhase::Decay,
            EnvelopePhase::Decay => EnvelopePhase::Sustain,
            EnvelopePhase::Sustain => EnvelopePhase::Release,
            _ => EnvelopePhase::Finished,
        }
    }
}

/// Six-phase envelope. Timing parameters arrive in time-cents and are stored
/// as slow-tick counts; the sustain parameter arrives in 0.1% attenuation
/// units and is stored as a level.
#[derive(Debug, Clone)]
pub struct Envelope {
    effective_output_rate: f32,
    params: [f32; EnvelopePhase::Finished as usize],
    phase: EnvelopePhase,
    phase_steps: u32,
    value: f32,
}

impl Default for Envelope {
    fn default() -> Envelope {
        Envelope {
            effective_output_rate: 0.0,
            params: [0.0; EnvelopePhase::Finished as usize],
            phase: EnvelopePhase::Delay,
            phase_steps: 0,
            value: 1.0,
        }
    }
}

impl Envelope {
    pub fn new(output_rate: f32, interval: u32) -> Envelope {
        Envelope { effective_output_rate: output_rate / interval as f32, ..Envelope::default() }
    }

    pub fn phase(&self) -> EnvelopePhase {
        self.phase
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn set_parameter(&mut self, phase: EnvelopePhase, param: f32) {
        if phase == EnvelopePhase::Sustain {
            self.params[EnvelopePhase::Sustain as usize] = 1.0 - 0.001 * param;
        } else if self.phase < EnvelopePhase::Finished {
            self.params[phase as usize] = self.effective_output_rate * time_cent_to_second(param);
        }
    }

    pub fn release(&mut self) {
        if self.phase < EnvelopePhase::Release {
            self.change_phase(EnvelopePhase::Release);
        }
    }

    pub fn update(&mut self) {
        if self.phase == EnvelopePhase::Finished {
            return;
        }

        self.phase_steps += 1;

        let mut i = self.phase as usize;
        while self.phase < EnvelopePhase::Finished
            && self.phase != EnvelopePhase::Sustain
            && self.phase_steps as f32 >= self.params[i]
        {
            let next = self.phase.next();
            self.change_phase(next);
            i = next as usize;
        }

        let sustain = self.params[EnvelopePhase::Sustain as usize];
        match self.phase {
            EnvelopePhase::Delay | EnvelopePhase::Finished => {
                self.value = 0.0;
            }
            EnvelopePhase::Attack => {
                self.value = self.phase_steps as f32 / self.params[i];
            }
            EnvelopePhase::Hold => {
                self.value = 1.0;
            }
            EnvelopePhase::Decay => {
                self.value = 1.0 - self.phase_steps as f32 / self.params[i];
                if self.value <= sustain {
                    self.value = sustain;
                    self.change_phase(EnvelopePhase::Sustain);
                }
            }
            EnvelopePhase::Sustain => {
                self.value = sustain;
            }
            EnvelopePhase::Release => {
                self.value -= 1.0 / self.params[i];
                if self.value <= 0.0 {
                    self.value = 0.0;
                    self.change_phase(EnvelopePhase::Finished);
                }
            }
        }
    }

    fn change_phase(&mut self, phase: EnvelopePhase) {
        self.phase = phase;
        self.phase_steps = 0;
    }
}

/// Delayed triangular oscillator spanning [-1, 1].
#[derive(Debug, Clone, Default)]
pub struct Lfo {
    output_rate: f32,
    interval: u32,
    steps: u32,
    delay: u32,
    delta: f32,
    value: f32,
    down: bool,
}

impl Lfo {
    pub fn new(output_rate: f32, interval: u32) -> Lfo {
        Lfo { output_rate, interval, ..Lfo::default() }
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn set_delay(&mut self, delay: f32) {
        self.delay = (self.output_rate * time_cent_to_second(delay)) as u32;
    }

    pub fn set_frequency(&mut self, freq: f32) {
        self.delta = 4.0 * self.interval as f32 * absolute_cent_to_hertz(freq) / self.output_rate;
    }

    pub fn update(&mut self) {
        if self.steps <= self.delay {
            self.steps += 1;
            return;
        }
        if !self.down {
            self.value += self.delta;
            if self.value > 1.0 {
                self.value = 2.0 - self.value;
                self.down = true;
            }
        } else {
            self.value -= self.delta;
            if self.value < -1.0 {
                self.value = -2.0 - self.value;
                self.down = false;
            }
        }
    }
}

/// 32.32 unsigned fixed point, used for the sample cursor so that minutes of
/// playback do not accumulate float drift.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedPoint {
    raw: u64,
}

impl FixedPoint {
    pub fn from_int(integer: u32) -> FixedPoint {
        FixedPoint { raw: (integer as u64) << 32 }
    }

    pub fn from_f64(value: f64) -> FixedPoint {
        FixedPoint { raw: (value * 4294967296.0) as u64 }
    }

    pub fn integer_part(&self) -> u32 {
        (self.raw >> 32) as u32
    }

    pub fn fractional_part(&self) -> f32 {
        ((self.raw & u32::MAX as u64) as f64 / 4294967296.0) as f32
    }
}

impl AddAssign for FixedPoint {
    fn add_assign(&mut self, other: FixedPoint) {
        self.raw = self.raw.wrapping_add(other.raw);
    }
}

impl Sub for FixedPoint {
    type Output = FixedPoint;
    fn sub(self, other: FixedPoint) -> FixedPoint {
        FixedPoint { raw: self.raw.wrapping_sub(other.raw) }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StereoValue {
    pub left: f32,
    pub right: f32,
}

impl StereoValue {
    pub fn new(left: f32, right: f32) -> StereoValue {
        StereoValue { left, right }
    }
}

impl Mul<f32> for StereoValue {
    type Output = StereoValue;
    fn mul(self, b: f32) -> StereoValue {
        StereoValue { left: self.left * b, right: self.right * b }
    }
}

impl Mul<StereoValue> for f32 {
    type Output = StereoValue;
    fn mul(self, b: StereoValue) -> StereoValue {
        StereoValue { left: self * b.left, right: self * b.right }
    }
}

impl Add for StereoValue {
    type Output = StereoValue;
    fn add(self, b: StereoValue) -> StereoValue {
        StereoValue { left: self.left + b.left, right: self.right + b.right }
    }
}

impl AddAssign for StereoValue {
    fn add_assign(&mut self, b: StereoValue) {
        self.left += b.left;
        self.right += b.right;
    }
}

/// Equal-power pan law over the ±500 pan generator range; hard left/right
/// outside it.
pub fn calculate_panned_volume(pan: f32) -> StereoValue {
    if pan <= -500.0 {
        StereoValue::new(1.0, 0.0)
    } else if pan >= 500.0 {
        StereoValue::new(0.0, 1.0)
    } else {
        StereoValue::new((PAN_FACTOR * (-pan + 500.0)).sin(), (PAN_FACTOR * (pan + 500.0)).sin())
    }
}

/// Runtime modulator: the zone parameter plus two cached normalized inputs.
#[derive(Debug, Clone)]
pub struct Modulator {
    param: ModulatorParam,
    source: f32,
    amount_source: f32,
    value: f32,
}

impl Modulator {
    pub fn new(param: ModulatorParam) -> Modulator {
        Modulator { param, source: 0.0, amount_source: 1.0, value: 0.0 }
    }

    pub fn destination(&self) -> u16 {
        self.param.destination
    }

    pub fn amount(&self) -> i16 {
        self.param.amount
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    /// Whether this modulator can ever lower attenuation below the static
    /// value; used to bound the worst-case audible volume for voice kills.
    pub fn can_be_negative(&self) -> bool {
        if self.param.transform == Transform::AbsoluteValue || self.param.amount == 0 {
            return false;
        }

        if self.param.amount > 0 {
            let no_src = self.param.source.is_general(GeneralController::NoController);
            let uni_src = self.param.source.polarity == SourcePolarity::Unipolar;
            let no_amt = self.param.amount_source.is_general(GeneralController::NoController);
            let uni_amt = self.param.amount_source.polarity == SourcePolarity::Unipolar;

            if (uni_src || no_src) && (uni_amt || no_amt) {
                return false;
            }
        }

        true
    }

    pub fn update_general_controller(&mut self, controller: GeneralController, value: f32) -> bool {
        let mut updated = false;
        if self.param.source.is_general(controller) {
            self.source = Modulator::map(value, &self.param.source);
            updated = true;
        }
        if self.param.amount_source.is_general(controller) {
            self.amount_source = Modulator::map(value, &self.param.amount_source);
            updated = true;
        }
        if updated {
            self.calculate_value();
        }
        updated
    }

    pub fn update_midi_controller(&mut self, controller: u8, value: u8) -> bool {
        let mut updated = false;
        if self.param.source.palette == ControllerPalette::Midi && controller == self.param.source.index {
            self.source = Modulator::map(value as f32, &self.param.source);
            updated = true;
        }
        if self.param.amount_source.palette == ControllerPalette::Midi
            && controller == self.param.amount_source.index
        {
            self.amount_source = Modulator::map(value as f32, &self.param.amount_source);
            updated = true;
        }
        if updated {
            self.calculate_value();
        }
        updated
    }

    fn calculate_value(&mut self) {
        let raw = self.param.amount as f32 * self.source * self.amount_source;
        self.value = if self.param.transform == Transform::AbsoluteValue { raw.abs() } else { raw };
    }

    fn map(value: f32, operand: &ModulatorSource) -> f32 {
        let value = if operand.is_general(GeneralController::PitchWheel) {
            value / (1 << 14) as f32
        } else {
            value / (1 << 7) as f32
        };

        if operand.source_type == SourceType::Switch {
            let off = if operand.polarity == SourcePolarity::Unipolar { 0.0 } else { -1.0 };
            let x = if operand.direction == SourceDirection::Positive { value } else { 1.0 - value };
            return if x >= 0.5 { 1.0 } else { off };
        }

        if operand.polarity == SourcePolarity::Unipolar {
            let x = if operand.direction == SourceDirection::Positive { value } else { 1.0 - value };
            match operand.source_type {
                SourceType::Linear => x,
                SourceType::Concave => concave_curve(x),
                SourceType::Convex => convex_curve(x),
                SourceType::Switch => 0.0,
            }
        } else {
            let dir = if operand.direction == SourceDirection::Positive { 1.0 } else { -1.0 };
            let sign = if value > 0.5 { 1.0 } else { -1.0 };
            let x = 2.0 * value - 1.0;
            match operand.source_type {
                SourceType::Linear => dir * x,
                SourceType::Concave => sign * dir * concave_curve(sign * x),
                SourceType::Convex => sign * dir * convex_curve(sign * x),
                SourceType::Switch => 0.0,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Playing,
    Sustained,
    Released,
    Finished,
    Unused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleMode {
    Unlooped,
    Looped,
    Unused,
    LoopedUntilRelease,
}

impl SampleMode {
    fn from_bits(bits: i16) -> SampleMode {
        match bits & 0b11 {
            1 => SampleMode::Looped,
            2 => SampleMode::Unused,
            3 => SampleMode::LoopedUntilRelease,
            _ => SampleMode::Unlooped,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RuntimeSample {
    pitch: f32,
    start: u32,
    end: u32,
    start_loop: u32,
    end_loop: u32,
}

/// One playing note. Voices live in a fixed pool and are recycled through
/// state transitions; nothing here allocates after `init` builds the
/// modulator list.
pub struct Voice {
    channel: usize,
    note_id: usize,
    actual_key: u8,
    sample_buffer: Arc<Vec<i16>>,
    generators: GeneratorSet,
    mode: SampleMode,
    rt_sample: RuntimeSample,
    key_scaling: i32,
    modulators: Vec<Modulator>,
    min_atten: f32,
    modulated: [f32; NUM_GENERATORS],
    percussion: bool,
    fine_tuning: f32,
    coarse_tuning: f32,
    delta_index_ratio: f64,
    steps: u32,
    status: VoiceState,
    voice_pitch: f32,
    index: FixedPoint,
    delta_index: FixedPoint,
    volume: StereoValue,
    amp: f32,
    delta_amp: f32,
    vol_env: Envelope,
    mod_env: Envelope,
    vib_lfo: Lfo,
    mod_lfo: Lfo,
}

impl Voice {
    pub fn new() -> Voice {
        Voice {
            channel: 0,
            note_id: 0,
            actual_key: 0,
            sample_buffer: Arc::new(Vec::new()),
            generators: GeneratorSet::default(),
            mode: SampleMode::Unlooped,
            rt_sample: RuntimeSample::default(),
            key_scaling: 0,
            modulators: Vec::new(),
            min_atten: 0.0,
            modulated: [0.0; NUM_GENERATORS],
            percussion: false,
            fine_tuning: 0.0,
            coarse_tuning: 0.0,
            delta_index_ratio: 0.0,
            steps: 0,
            status: VoiceState::Unused,
            voice_pitch: 0.0,
            index: FixedPoint::default(),
            delta_index: FixedPoint::default(),
            volume: StereoValue::default(),
            amp: 0.0,
            delta_amp: 0.0,
            vol_env: Envelope::default(),
            mod_env: Envelope::default(),
            vib_lfo: Lfo::default(),
            mod_lfo: Lfo::default(),
        }
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn note_id(&self) -> usize {
        self.note_id
    }

    pub fn amp(&self) -> f32 {
        self.amp
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn actual_key(&self) -> u8 {
        self.actual_key
    }

    pub fn is_percussion(&self) -> bool {
        self.percussion
    }

    pub fn exclusive_class(&self) -> i16 {
        self.generators.get_or_default(GeneratorType::ExclusiveClass)
    }

    pub fn status(&self) -> VoiceState {
        self.status
    }

    pub fn set_status(&mut self, status: VoiceState) {
        self.status = status;
    }

    pub fn sample_index(&self) -> u32 {
        self.index.integer_part()
    }

    pub fn delta_index(&self) -> f64 {
        self.delta_index.integer_part() as f64 + self.delta_index.fractional_part() as f64
    }

    #[allow(clippy::too_many_arguments)]
    pub fn init(
        &mut self,
        channel: usize,
        note_id: usize,
        output_rate: f32,
        sample: &Sample,
        sample_buffer: Arc<Vec<i16>>,
        generators: GeneratorSet,
        mod_params: &ModulatorParameterSet,
        key: u8,
        velocity: u8,
        percussion: bool,
    ) {
        if sample.is_disabled() {
            // a note aimed only at disabled samples completes immediately
            self.status = VoiceState::Finished;
            return;
        }

        self.channel = channel;
        self.note_id = note_id;
        self.actual_key = key;
        self.sample_buffer = sample_buffer;
        self.generators = generators;
        self.percussion = percussion;
        self.fine_tuning = 0.0;
        self.coarse_tuning = 0.0;
        self.steps = 0;
        self.status = VoiceState::Playing;
        self.index = FixedPoint::from_int(sample.start);
        self.delta_index = FixedPoint::default();
        self.volume = StereoValue::new(1.0, 1.0);
        self.amp = 0.0;
        self.delta_amp = 0.0;
        self.vol_env = Envelope::new(output_rate, CALC_INTERVAL);
        self.mod_env = Envelope::new(output_rate, CALC_INTERVAL);
        self.vib_lfo = Lfo::new(output_rate, CALC_INTERVAL);
        self.mod_lfo = Lfo::new(output_rate, CALC_INTERVAL);

        self.mode = SampleMode::from_bits(self.generators.get_or_default(GeneratorType::SampleModes));
        let overridden_sample_key = self.generators.get_or_default(GeneratorType::OverridingRootKey);
        self.rt_sample.pitch = (if overridden_sample_key > 0 { overridden_sample_key as f32 } else { sample.key as f32 })
            - 0.01 * sample.correction as f32;

        let offset = |fine: GeneratorType, coarse: GeneratorType, base: u32, generators: &GeneratorSet| -> i64 {
            base as i64
                + COARSE_UNIT * generators.get_or_default(coarse) as i64
                + generators.get_or_default(fine) as i64
        };
        let start = offset(GeneratorType::StartAddressOffset, GeneratorType::StartAddressCoarseOffset, sample.start, &self.generators);
        let end = offset(GeneratorType::EndAddressOffset, GeneratorType::EndAddressCoarseOffset, sample.end, &self.generators);
        let start_loop = offset(GeneratorType::StartLoopAddressOffset, GeneratorType::StartLoopAddressCoarseOffset, sample.start_loop, &self.generators);
        let end_loop = offset(GeneratorType::EndLoopAddressOffset, GeneratorType::EndLoopAddressCoarseOffset, sample.end_loop, &self.generators);

        // clamp offset-adjusted ranges back into the pool
        let buffer_size = self.sample_buffer.len() as i64;
        self.rt_sample.start = start.clamp(0, buffer_size - 1) as u32;
        self.rt_sample.end = end.clamp(self.rt_sample.start as i64 + 1, buffer_size) as u32;
        self.rt_sample.start_loop = start_loop.clamp(self.rt_sample.start as i64, self.rt_sample.end as i64 - 1) as u32;
        self.rt_sample.end_loop = end_loop.clamp(self.rt_sample.start_loop as i64 + 1, self.rt_sample.end as i64) as u32;
        self.index = FixedPoint::from_int(self.rt_sample.start);

        self.delta_index_ratio =
            1.0 / key_to_hertz(self.rt_sample.pitch) as f64 * sample.sample_rate as f64 / output_rate as f64;

        self.modulators.clear();
        for param in mod_params.params() {
            self.modulators.push(Modulator::new(*param));
        }

        let gen_velocity = self.generators.get_or_default(GeneratorType::Velocity);
        let effective_velocity = if gen_velocity > 0 { gen_velocity as f32 } else { velocity as f32 };
        self.update_general_controller(GeneralController::NoteOnVelocity, effective_velocity);

        let gen_key = self.generators.get_or_default(GeneratorType::KeyNumber);
        let overridden_key = if gen_key > 0 { gen_key } else { key as i16 };
        self.key_scaling = 60 - overridden_key as i32;
        self.update_general_controller(GeneralController::NoteOnKeyNumber, overridden_key as f32);

        let mut min_modulated_atten =
            ATTEN_FACTOR * self.generators.get_or_default(GeneratorType::InitialAttenuation) as f32;
        for modulator in &self.modulators {
            if modulator.destination() == GeneratorType::InitialAttenuation as u16 && modulator.can_be_negative() {
                // the modulator may increase volume
                min_modulated_atten -= modulator.amount().unsigned_abs() as f32;
            }
        }
        self.min_atten = sample.min_atten + min_modulated_atten.max(0.0);

        for i in 0..NUM_GENERATORS {
            self.modulated[i] = self.generators.get_index(i) as f32;
        }
        const INIT_GENERATORS: [GeneratorType; 18] = [
            GeneratorType::Pan,
            GeneratorType::DelayModLfo,
            GeneratorType::FreqModLfo,
            GeneratorType::DelayVibLfo,
            GeneratorType::FreqVibLfo,
            GeneratorType::DelayModEnv,
            GeneratorType::AttackModEnv,
            GeneratorType::HoldModEnv,
            GeneratorType::DecayModEnv,
            GeneratorType::SustainModEnv,
            GeneratorType::ReleaseModEnv,
            GeneratorType::DelayVolEnv,
            GeneratorType::AttackVolEnv,
            GeneratorType::HoldVolEnv,
            GeneratorType::DecayVolEnv,
            GeneratorType::SustainVolEnv,
            GeneratorType::ReleaseVolEnv,
            GeneratorType::CoarseTune,
        ];
        for generator in INIT_GENERATORS {
            self.update_modulated_params(generator as u16);
        }
    }

    pub fn update_general_controller(&mut self, controller: GeneralController, value: f32) {
        for i in 0..self.modulators.len() {
            if self.modulators[i].update_general_controller(controller, value) {
                let destination = self.modulators[i].destination();
                self.update_modulated_params(destination);
            }
        }
    }

    pub fn update_midi_controller(&mut self, controller: u8, value: u8) {
        for i in 0..self.modulators.len() {
            if self.modulators[i].update_midi_controller(controller, value) {
                let destination = self.modulators[i].destination();
                self.update_modulated_params(destination);
            }
        }
    }

    pub fn update_fine_tuning(&mut self, fine_tuning: f32) {
        self.fine_tuning = fine_tuning;
        self.update_modulated_params(GeneratorType::FineTune as u16);
    }

    pub fn update_coarse_tuning(&mut self, coarse_tuning: f32) {
        self.coarse_tuning = coarse_tuning;
        self.update_modulated_params(GeneratorType::CoarseTune as u16);
    }

    pub fn release(&mut self, sustained: bool) {
        if self.status != VoiceState::Playing && self.status != VoiceState::Sustained {
            return;
        }
        if sustained {
            self.status = VoiceState::Sustained;
        } else {
            self.status = VoiceState::Released;
            self.vol_env.release();
            self.mod_env.release();
        }
    }

    /// Advance one output frame. Envelope/LFO/pitch work happens on the slow
    /// path every `CALC_INTERVAL` frames.
    pub fn update(&mut self) {
        let calc = self.steps % CALC_INTERVAL == 0;
        self.steps = self.steps.wrapping_add(1);

        if calc {
            // dynamic range of signed 16-bit samples in centibels
            let dynamic_range = 200.0 * (i16::MAX as f32 + 1.0).log10();
            if self.vol_env.phase() == EnvelopePhase::Finished
                || (self.vol_env.phase() > EnvelopePhase::Attack
                    && self.min_atten + 960.0 * (1.0 - self.vol_env.value()) >= dynamic_range)
            {
                self.status = VoiceState::Finished;
                return;
            }

            self.vol_env.update();
        }

        self.index += self.delta_index;

        match self.mode {
            SampleMode::Looped => {
                if self.index.integer_part() >= self.rt_sample.end_loop {
                    self.index = self.index - FixedPoint::from_int(self.rt_sample.end_loop - self.rt_sample.start_loop);
                }
            }
            SampleMode::LoopedUntilRelease => {
                if self.status == VoiceState::Released {
                    if self.index.integer_part() >= self.rt_sample.end {
                        self.status = VoiceState::Finished;
                        return;
                    }
                } else if self.index.integer_part() >= self.rt_sample.end_loop {
                    self.index = self.index - FixedPoint::from_int(self.rt_sample.end_loop - self.rt_sample.start_loop);
                }
            }
            SampleMode::Unlooped | SampleMode::Unused => {
                if self.index.integer_part() >= self.rt_sample.end {
                    self.status = VoiceState::Finished;
                    return;
                }
            }
        }

        self.amp += self.delta_amp;

        if calc {
            self.mod_env.update();
            self.vib_lfo.update();
            self.mod_lfo.update();

            let mod_env_value = if self.mod_env.phase() == EnvelopePhase::Attack {
                convex_curve(self.mod_env.value())
            } else {
                self.mod_env.value()
            };
            let pitch = self.voice_pitch
                + 0.01
                    * (self.modulated_generator(GeneratorType::ModEnvToPitch) * mod_env_value
                        + self.modulated_generator(GeneratorType::VibLfoToPitch) * self.vib_lfo.value()
                        + self.modulated_generator(GeneratorType::ModLfoToPitch) * self.mod_lfo.value());
            self.delta_index = FixedPoint::from_f64(self.delta_index_ratio * key_to_hertz(pitch) as f64);

            let atten_mod_lfo = self.modulated_generator(GeneratorType::ModLfoToVolume) * self.mod_lfo.value();
            let target_amp = if self.vol_env.phase() == EnvelopePhase::Attack {
                self.vol_env.value() * attenuation_to_amplitude(atten_mod_lfo)
            } else {
                attenuation_to_amplitude(960.0 * (1.0 - self.vol_env.value()) + atten_mod_lfo)
            };
            self.delta_amp = (target_amp - self.amp) / CALC_INTERVAL as f32;
        }
    }

    /// Current stereo output without advancing any state.
    pub fn render(&self) -> StereoValue {
        let i = self.index.integer_part() as usize;
        let r = self.index.fractional_part();
        let current = *self.sample_buffer.get(i).unwrap_or(&0) as f32;
        let next = *self.sample_buffer.get(i + 1).unwrap_or(&0) as f32;
        let interpolated = (1.0 - r) * current + r * next;
        self.amp * self.volume * (interpolated / i16::MAX as f32)
    }

    fn modulated_generator(&self, gen_type: GeneratorType) -> f32 {
        self.modulated[gen_type as usize]
    }

    fn update_modulated_params(&mut self, destination: u16) {
        let mut new_modulated = self.generators.get_index(destination as usize) as f32;
        if destination == GeneratorType::InitialAttenuation as u16 {
            new_modulated *= ATTEN_FACTOR;
        }
        for modulator in &self.modulators {
            if modulator.destination() == destination {
                new_modulated += modulator.value();
            }
        }
        self.modulated[destination as usize] = new_modulated;

        match GeneratorType::from_repr(destination) {
            Some(GeneratorType::Pan) | Some(GeneratorType::InitialAttenuation) => {
                self.volume = attenuation_to_amplitude(self.modulated_generator(GeneratorType::InitialAttenuation))
                    * calculate_panned_volume(self.modulated_generator(GeneratorType::Pan));
            }
            Some(GeneratorType::DelayModLfo) => self.mod_lfo.set_delay(new_modulated),
            Some(GeneratorType::FreqModLfo) => self.mod_lfo.set_frequency(new_modulated),
            Some(GeneratorType::DelayVibLfo) => self.vib_lfo.set_delay(new_modulated),
            Some(GeneratorType::FreqVibLfo) => self.vib_lfo.set_frequency(new_modulated),
            Some(GeneratorType::DelayModEnv) => self.mod_env.set_parameter(EnvelopePhase::Delay, new_modulated),
            Some(GeneratorType::AttackModEnv) => self.mod_env.set_parameter(EnvelopePhase::Attack, new_modulated),
            Some(GeneratorType::HoldModEnv) | Some(GeneratorType::KeyNumToModEnvHold) => {
                let hold = self.modulated_generator(GeneratorType::HoldModEnv)
                    + self.modulated_generator(GeneratorType::KeyNumToModEnvHold) * self.key_scaling as f32;
                self.mod_env.set_parameter(EnvelopePhase::Hold, hold);
            }
            Some(GeneratorType::DecayModEnv) | Some(GeneratorType::KeyNumToModEnvDecay) => {
                let decay = self.modulated_generator(GeneratorType::DecayModEnv)
                    + self.modulated_generator(GeneratorType::KeyNumToModEnvDecay) * self.key_scaling as f32;
                self.mod_env.set_parameter(EnvelopePhase::Decay, decay);
            }
            Some(GeneratorType::SustainModEnv) => self.mod_env.set_parameter(EnvelopePhase::Sustain, new_modulated),
            Some(GeneratorType::ReleaseModEnv) => self.mod_env.set_parameter(EnvelopePhase::Release, new_modulated),
            Some(GeneratorType::DelayVolEnv) => self.vol_env.set_parameter(EnvelopePhase::Delay, new_modulated),
            Some(GeneratorType::AttackVolEnv) => self.vol_env.set_parameter(EnvelopePhase::Attack, new_modulated),
            Some(GeneratorType::HoldVolEnv) | Some(GeneratorType::KeyNumToVolEnvHold) => {
                let hold = self.modulated_generator(GeneratorType::HoldVolEnv)
                    + self.modulated_generator(GeneratorType::KeyNumToVolEnvHold) * self.key_scaling as f32;
                self.vol_env.set_parameter(EnvelopePhase::Hold, hold);
            }
            Some(GeneratorType::DecayVolEnv) | Some(GeneratorType::KeyNumToVolEnvDecay) => {
                let decay = self.modulated_generator(GeneratorType::DecayVolEnv)
                    + self.modulated_generator(GeneratorType::KeyNumToVolEnvDecay) * self.key_scaling as f32;
                self.vol_env.set_parameter(EnvelopePhase::Decay, decay);
            }
            Some(GeneratorType::SustainVolEnv) => self.vol_env.set_parameter(EnvelopePhase::Sustain, new_modulated),
            Some(GeneratorType::ReleaseVolEnv) => self.vol_env.set_parameter(EnvelopePhase::Release, new_modulated),
            Some(GeneratorType::CoarseTune)
            | Some(GeneratorType::FineTune)
            | Some(GeneratorType::ScaleTuning)
            | Some(GeneratorType::Pitch) => {
                self.voice_pitch = self.rt_sample.pitch
                    + 0.01 * self.modulated_generator(GeneratorType::Pitch)
                    + 0.01
                        * self.generators.get_or_default(GeneratorType::ScaleTuning) as f32
                        * (self.actual_key as f32 - self.rt_sample.pitch)
                    + self.coarse_tuning
                    + self.modulated_generator(GeneratorType::CoarseTune)
                    + 0.01 * (self.fine_tuning + self.modulated_generator(GeneratorType::FineTune));
            }
            _ => {}
        }
    }
}

impl Default for Voice {
    fn default() -> Voice {
        Voice::new()
    }
}

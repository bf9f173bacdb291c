use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use bevy_reflect::Reflect;
use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};
use indexmap::IndexMap;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use strum::{Display, FromRepr};
use tracing::{debug, warn};

use crate::dtype::{read_record_list, record_name, AutoRecord, SynthError};
use crate::math::amplitude_to_attenuation;
use crate::reader::ByteSource;

pub const NUM_GENERATORS: usize = 62;
pub const PERCUSSION_BANK: u16 = 128;

static DEFAULT_GENERATOR_VALUES: [i16; NUM_GENERATORS] = [
    0, 0, 0, 0, 0, 0, 0, 0, 13500, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, -12000, 0, -12000, 0, -12000, -12000, -12000, -12000, 0, -12000, 0,
    0, -12000, -12000, -12000, -12000, 0, -12000, 0, 0, 0, 0, 0, 0, 0, -1, -1,
    0, 0, 0, 0, 0, 0, 0, 0, 100, 0, -1, 0, 0, 0,
];

/// SF2 generator opcodes, plus the synthetic `Pitch` destination used by the
/// default pitch-wheel modulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Display)]
#[repr(u16)]
pub enum GeneratorType {
    StartAddressOffset = 0,
    EndAddressOffset = 1,
    StartLoopAddressOffset = 2,
    EndLoopAddressOffset = 3,
    StartAddressCoarseOffset = 4,
    ModLfoToPitch = 5,
    VibLfoToPitch = 6,
    ModEnvToPitch = 7,
    InitialFilterFc = 8,
    InitialFilterQ = 9,
    ModLfoToFilterFc = 10,
    ModEnvToFilterFc = 11,
    EndAddressCoarseOffset = 12,
    ModLfoToVolume = 13,
    ChorusEffectsSend = 15,
    ReverbEffectsSend = 16,
    Pan = 17,
    DelayModLfo = 21,
    FreqModLfo = 22,
    DelayVibLfo = 23,
    FreqVibLfo = 24,
    DelayModEnv = 25,
    AttackModEnv = 26,
    HoldModEnv = 27,
    DecayModEnv = 28,
    SustainModEnv = 29,
    ReleaseModEnv = 30,
    KeyNumToModEnvHold = 31,
    KeyNumToModEnvDecay = 32,
    DelayVolEnv = 33,
    AttackVolEnv = 34,
    HoldVolEnv = 35,
    DecayVolEnv = 36,
    SustainVolEnv = 37,
    ReleaseVolEnv = 38,
    KeyNumToVolEnvHold = 39,
    KeyNumToVolEnvDecay = 40,
    Instrument = 41,
    KeyRange = 43,
    VelocityRange = 44,
    StartLoopAddressCoarseOffset = 45,
    KeyNumber = 46,
    Velocity = 47,
    InitialAttenuation = 48,
    EndLoopAddressCoarseOffset = 50,
    CoarseTune = 51,
    FineTune = 52,
    SampleId = 53,
    SampleModes = 54,
    ScaleTuning = 56,
    ExclusiveClass = 57,
    OverridingRootKey = 58,
    EndOperator = 60,
    // non-standard, destination of the default pitch bend modulator
    Pitch = 61,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GeneralController {
    NoController = 0,
    NoteOnVelocity = 2,
    NoteOnKeyNumber = 3,
    PolyphonicPressure = 10,
    ChannelPressure = 13,
    PitchWheel = 14,
    PitchWheelSensitivity = 16,
    Link = 127,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPalette {
    General,
    Midi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceDirection {
    Positive,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourcePolarity {
    Unipolar,
    Bipolar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Linear,
    Concave,
    Convex,
    Switch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Linear,
    AbsoluteValue,
}

/// One packed source-operand word of a modulator: controller index, palette,
/// direction, polarity and mapping curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModulatorSource {
    pub index: u8,
    pub palette: ControllerPalette,
    pub direction: SourceDirection,
    pub polarity: SourcePolarity,
    pub source_type: SourceType,
}

impl ModulatorSource {
    pub fn decode(data: u16) -> ModulatorSource {
        ModulatorSource {
            index: (data & 127) as u8,
            palette: if (data >> 7) & 1 == 0 { ControllerPalette::General } else { ControllerPalette::Midi },
            direction: if (data >> 8) & 1 == 0 { SourceDirection::Positive } else { SourceDirection::Negative },
            polarity: if (data >> 9) & 1 == 0 { SourcePolarity::Unipolar } else { SourcePolarity::Bipolar },
            source_type: match (data >> 10) & 63 {
                0 => SourceType::Linear,
                1 => SourceType::Concave,
                2 => SourceType::Convex,
                3 => SourceType::Switch,
                other => {
                    debug!(curve = other, "unknown modulator curve, treating as linear");
                    SourceType::Linear
                }
            },
        }
    }

    pub fn is_general(&self, controller: GeneralController) -> bool {
        self.palette == ControllerPalette::General && self.index == controller as u8
    }

    fn general(index: GeneralController, direction: SourceDirection, polarity: SourcePolarity, source_type: SourceType) -> ModulatorSource {
        ModulatorSource { index: index as u8, palette: ControllerPalette::General, direction, polarity, source_type }
    }

    fn midi(index: u8, direction: SourceDirection, polarity: SourcePolarity, source_type: SourceType) -> ModulatorSource {
        ModulatorSource { index, palette: ControllerPalette::Midi, direction, polarity, source_type }
    }
}

/// The 5-tuple stored in pmod/imod records. `destination` is the raw
/// generator opcode (always < `NUM_GENERATORS` once parsed).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModulatorParam {
    pub source: ModulatorSource,
    pub destination: u16,
    pub amount: i16,
    pub amount_source: ModulatorSource,
    pub transform: Transform,
}

impl ModulatorParam {
    /// Two modulators are identical when everything but the amount matches;
    /// identical modulators supersede or sum depending on the merge rule.
    fn is_identical(&self, other: &ModulatorParam) -> bool {
        self.source == other.source
            && self.destination == other.destination
            && self.amount_source == other.amount_source
            && self.transform == other.transform
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModulatorParameterSet {
    params: Vec<ModulatorParam>,
}

impl ModulatorParameterSet {
    pub fn params(&self) -> &[ModulatorParam] {
        &self.params
    }

    /// Keep the first occurrence of an identity; later identical modulators
    /// are dropped.
    pub fn append(&mut self, param: ModulatorParam) {
        for p in &self.params {
            if p.is_identical(&param) {
                return;
            }
        }
        self.params.push(param);
    }

    /// Sum amounts for an identical modulator instead of dropping it.
    pub fn add_or_append(&mut self, param: ModulatorParam) {
        for p in &mut self.params {
            if p.is_identical(&param) {
                p.amount += param.amount;
                return;
            }
        }
        self.params.push(param);
    }

    pub fn merge(&mut self, other: &ModulatorParameterSet) {
        for param in &other.params {
            self.append(*param);
        }
    }

    pub fn merge_and_add(&mut self, other: &ModulatorParameterSet) {
        for param in &other.params {
            self.add_or_append(*param);
        }
    }

    /// The ten default modulators of SoundFont Technical Specification 2.04,
    /// section 8.4.
    pub fn default_parameters() -> &'static ModulatorParameterSet {
        &DEFAULT_MODULATORS
    }
}

lazy_static! {
    static ref DEFAULT_MODULATORS: ModulatorParameterSet = {
        let no_controller = ModulatorSource::general(
            GeneralController::NoController,
            SourceDirection::Positive,
            SourcePolarity::Unipolar,
            SourceType::Linear,
        );
        let mut set = ModulatorParameterSet::default();
        // 8.4.1 MIDI Note-On Velocity to Initial Attenuation
        set.append(ModulatorParam {
            source: ModulatorSource::general(GeneralController::NoteOnVelocity, SourceDirection::Negative, SourcePolarity::Unipolar, SourceType::Concave),
            destination: GeneratorType::InitialAttenuation as u16,
            amount: 960,
            amount_source: no_controller,
            transform: Transform::Linear,
        });
        // 8.4.2 MIDI Note-On Velocity to Filter Cutoff
        set.append(ModulatorParam {
            source: ModulatorSource::general(GeneralController::NoteOnVelocity, SourceDirection::Negative, SourcePolarity::Unipolar, SourceType::Linear),
            destination: GeneratorType::InitialFilterFc as u16,
            amount: -2400,
            amount_source: no_controller,
            transform: Transform::Linear,
        });
        // 8.4.3 MIDI Channel Pressure to Vibrato LFO Pitch Depth
        set.append(ModulatorParam {
            source: ModulatorSource::midi(13, SourceDirection::Positive, SourcePolarity::Unipolar, SourceType::Linear),
            destination: GeneratorType::VibLfoToPitch as u16,
            amount: 50,
            amount_source: no_controller,
            transform: Transform::Linear,
        });
        // 8.4.4 MIDI Continuous Controller 1 to Vibrato LFO Pitch Depth
        set.append(ModulatorParam {
            source: ModulatorSource::midi(1, SourceDirection::Positive, SourcePolarity::Unipolar, SourceType::Linear),
            destination: GeneratorType::VibLfoToPitch as u16,
            amount: 50,
            amount_source: no_controller,
            transform: Transform::Linear,
        });
        // 8.4.5 MIDI Continuous Controller 7 to Initial Attenuation
        set.append(ModulatorParam {
            source: ModulatorSource::midi(7, SourceDirection::Negative, SourcePolarity::Unipolar, SourceType::Concave),
            destination: GeneratorType::InitialAttenuation as u16,
            amount: 960,
            amount_source: no_controller,
            transform: Transform::Linear,
        });
        // 8.4.6 MIDI Continuous Controller 10 to Pan Position
        set.append(ModulatorParam {
            source: ModulatorSource::midi(10, SourceDirection::Positive, SourcePolarity::Bipolar, SourceType::Linear),
            destination: GeneratorType::Pan as u16,
            amount: 500,
            amount_source: no_controller,
            transform: Transform::Linear,
        });
        // 8.4.7 MIDI Continuous Controller 11 to Initial Attenuation
        set.append(ModulatorParam {
            source: ModulatorSource::midi(11, SourceDirection::Negative, SourcePolarity::Unipolar, SourceType::Concave),
            destination: GeneratorType::InitialAttenuation as u16,
            amount: 960,
            amount_source: no_controller,
            transform: Transform::Linear,
        });
        // 8.4.8 MIDI Continuous Controller 91 to Reverb Effects Send
        set.append(ModulatorParam {
            source: ModulatorSource::midi(91, SourceDirection::Positive, SourcePolarity::Unipolar, SourceType::Linear),
            destination: GeneratorType::ReverbEffectsSend as u16,
            amount: 200,
            amount_source: no_controller,
            transform: Transform::Linear,
        });
        // 8.4.9 MIDI Continuous Controller 93 to Chorus Effects Send
        set.append(ModulatorParam {
            source: ModulatorSource::midi(93, SourceDirection::Positive, SourcePolarity::Unipolar, SourceType::Linear),
            destination: GeneratorType::ChorusEffectsSend as u16,
            amount: 200,
            amount_source: no_controller,
            transform: Transform::Linear,
        });
        // 8.4.10 MIDI Pitch Wheel to Initial Pitch, scaled by Pitch Wheel
        // Sensitivity
        set.append(ModulatorParam {
            source: ModulatorSource::general(GeneralController::PitchWheel, SourceDirection::Positive, SourcePolarity::Bipolar, SourceType::Linear),
            destination: GeneratorType::Pitch as u16,
            amount: 12700,
            amount_source: ModulatorSource::general(GeneralController::PitchWheelSensitivity, SourceDirection::Positive, SourcePolarity::Unipolar, SourceType::Linear),
            transform: Transform::Linear,
        });
        set
    };
}

#[derive(Debug, Clone, Copy)]
struct Generator {
    used: bool,
    amount: i16,
}

/// Fixed-length generator table; unused entries report the SF2 default.
#[derive(Debug, Clone)]
pub struct GeneratorSet {
    generators: [Generator; NUM_GENERATORS],
}

impl Default for GeneratorSet {
    fn default() -> GeneratorSet {
        let mut generators = [Generator { used: false, amount: 0 }; NUM_GENERATORS];
        for (generator, &default) in generators.iter_mut().zip(DEFAULT_GENERATOR_VALUES.iter()) {
            generator.amount = default;
        }
        GeneratorSet { generators }
    }
}

impl GeneratorSet {
    pub fn get_or_default(&self, gen_type: GeneratorType) -> i16 {
        self.generators[gen_type as usize].amount
    }

    pub fn get_index(&self, index: usize) -> i16 {
        self.generators[index].amount
    }

    pub fn set(&mut self, gen_type: GeneratorType, amount: i16) {
        self.set_index(gen_type as usize, amount);
    }

    pub fn set_index(&mut self, index: usize, amount: i16) {
        self.generators[index] = Generator { used: true, amount };
    }

    /// Take used entries from `other` where this set is still unset. Used
    /// for global-zone promotion.
    pub fn merge(&mut self, other: &GeneratorSet) {
        for (generator, theirs) in self.generators.iter_mut().zip(other.generators.iter()) {
            if !generator.used && theirs.used {
                *generator = *theirs;
            }
        }
    }

    /// Additively layer used entries of `other` over this set. Used for
    /// preset-zone offsets on top of instrument-zone values.
    pub fn add(&mut self, other: &GeneratorSet) {
        for (generator, theirs) in self.generators.iter_mut().zip(other.generators.iter()) {
            if theirs.used {
                generator.amount += theirs.amount;
                generator.used = true;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub min: i8,
    pub max: i8,
}

impl Default for Range {
    fn default() -> Range {
        Range { min: 0, max: 127 }
    }
}

impl Range {
    pub fn contains(&self, value: i8) -> bool {
        self.min <= value && value <= self.max
    }
}

#[derive(Debug, Clone, Default)]
pub struct Zone {
    pub key_range: Range,
    pub velocity_range: Range,
    pub generators: GeneratorSet,
    pub modulators: ModulatorParameterSet,
}

impl Zone {
    pub fn is_in_range(&self, key: i8, velocity: i8) -> bool {
        self.key_range.contains(key) && self.velocity_range.contains(velocity)
    }
}

#[derive(Debug, Clone)]
pub struct Instrument {
    pub name: String,
    pub zones: Vec<Zone>,
}

#[derive(Debug, Clone)]
pub struct Preset {
    pub name: String,
    pub bank: u16,
    pub preset_id: u16,
    pub zones: Vec<Zone>,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SampleTypes: u16 {
        const MONO = 0x0001;
        const RIGHT = 0x0002;
        const LEFT = 0x0004;
        const LINKED = 0x0008;
        const ROM = 0x8000;
    }
}

/// One slice into the shared 16-bit PCM pool. A sample with `start == end`
/// is disabled and never produces audio.
#[derive(Debug, Clone)]
pub struct Sample {
    pub name: String,
    pub start: u32,
    pub end: u32,
    pub start_loop: u32,
    pub end_loop: u32,
    pub sample_rate: u32,
    pub key: i8,
    pub correction: i8,
    pub sample_types: SampleTypes,
    pub min_atten: f32,
}

impl Sample {
    fn from_record(record: &SampleRecord, buffer: &[i16]) -> Result<Sample, SynthError> {
        let mut sample = Sample {
            name: record_name(&record.name),
            start: record.start,
            end: record.end,
            start_loop: record.start_loop,
            end_loop: record.end_loop,
            sample_rate: record.sample_rate,
            key: record.original_key,
            correction: record.correction,
            sample_types: SampleTypes::from_bits_truncate(record.sample_type),
            min_atten: 0.0,
        };
        if sample.start as usize >= buffer.len() || sample.end as usize >= buffer.len() {
            return Err(SynthError::SampleOutOfRange);
        }
        if sample.sample_types.contains(SampleTypes::ROM) {
            warn!(name = %sample.name, "ROM sample disabled");
            sample.disable();
        } else if sample.start < sample.end {
            let mut sample_max = 0i32;
            for &frame in &buffer[sample.start as usize..sample.end as usize] {
                sample_max = sample_max.max((frame as i32).abs());
            }
            sample.min_atten = amplitude_to_attenuation(sample_max as f32 / i16::MAX as f32);
        } else {
            // consistent with Fluidsynth/TinySoundFont handling of inverted
            // ranges
            sample.disable();
        }
        Ok(sample)
    }

    fn disable(&mut self) {
        self.start = 0;
        self.end = 0;
        self.start_loop = 0;
        self.end_loop = 0;
    }

    pub fn is_disabled(&self) -> bool {
        self.start == self.end
    }
}

/// INFO-list metadata; only `ifil` is load-bearing, the strings are kept
/// for tooling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BankInfo {
    pub version_major: u16,
    pub version_minor: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engineers: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copyright: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<String>,
}

#[derive(Debug, Default, Reflect)]
struct PresetHeaderRecord {
    name: [u8; 20],
    preset: u16,
    bank: u16,
    bag_index: u16,
    library: u32,
    genre: u32,
    morphology: u32,
}
impl AutoRecord for PresetHeaderRecord {
    const STRIDE: usize = 38;
}

#[derive(Debug, Default, Reflect)]
struct BagRecord {
    gen_index: u16,
    mod_index: u16,
}
impl AutoRecord for BagRecord {
    const STRIDE: usize = 4;
}

#[derive(Debug, Default, Reflect)]
struct ModRecord {
    src_oper: u16,
    dest_oper: u16,
    amount: i16,
    amount_src_oper: u16,
    trans_oper: u16,
}
impl AutoRecord for ModRecord {
    const STRIDE: usize = 10;
}

impl ModRecord {
    fn to_param(&self) -> Option<ModulatorParam> {
        if self.dest_oper as usize >= NUM_GENERATORS {
            debug!(destination = self.dest_oper, "modulator destination out of range, ignored");
            return None;
        }
        let transform = match self.trans_oper {
            2 => Transform::AbsoluteValue,
            _ => Transform::Linear,
        };
        Some(ModulatorParam {
            source: ModulatorSource::decode(self.src_oper),
            destination: self.dest_oper,
            amount: self.amount,
            amount_source: ModulatorSource::decode(self.amount_src_oper),
            transform,
        })
    }
}

#[derive(Debug, Default, Reflect)]
struct GenRecord {
    oper: u16,
    amount: u16,
}
impl AutoRecord for GenRecord {
    const STRIDE: usize = 4;
}

impl GenRecord {
    fn range(&self) -> Range {
        Range { min: (self.amount & 0xFF) as i8, max: (self.amount >> 8) as i8 }
    }

    fn signed_amount(&self) -> i16 {
        self.amount as i16
    }
}

#[derive(Debug, Default, Reflect)]
struct InstRecord {
    name: [u8; 20],
    bag_index: u16,
}
impl AutoRecord for InstRecord {
    const STRIDE: usize = 22;
}

#[derive(Debug, Default, Reflect)]
struct SampleRecord {
    name: [u8; 20],
    start: u32,
    end: u32,
    start_loop: u32,
    end_loop: u32,
    sample_rate: u32,
    original_key: i8,
    correction: i8,
    sample_link: u16,
    sample_type: u16,
}
impl AutoRecord for SampleRecord {
    const STRIDE: usize = 46;
}

struct ChunkHeader {
    id: [u8; 4],
    size: u32,
}

fn read_chunk_header(source: &mut ByteSource) -> Result<ChunkHeader, SynthError> {
    let mut id = [0u8; 4];
    source.read_exact(&mut id).map_err(|_| SynthError::Truncated("chunk header"))?;
    let size = source.read_u32::<LittleEndian>().map_err(|_| SynthError::Truncated("chunk header"))?;
    Ok(ChunkHeader { id, size })
}

fn read_four_cc(source: &mut ByteSource) -> Result<[u8; 4], SynthError> {
    let mut id = [0u8; 4];
    source.read_exact(&mut id).map_err(|_| SynthError::Truncated("chunk type"))?;
    Ok(id)
}

fn read_info_string(source: &mut ByteSource, size: u32) -> Result<Option<String>, SynthError> {
    let mut raw = vec![0u8; size as usize];
    source.read_exact(&mut raw).map_err(|_| SynthError::Truncated("INFO string"))?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let text = String::from_utf8_lossy(&raw[..end]).trim().to_string();
    Ok(if text.is_empty() { None } else { Some(text) })
}

/// Walk the bags of one preset header or instrument record into zones.
///
/// The first bag is the global zone iff its last generator is not the
/// terminal (`Instrument` for presets, `SampleId` for instruments); other
/// bags lacking the terminal generator are ignored. Global-zone generators
/// and modulators merge into every sibling as defaults.
fn read_bags(
    bags: &[BagRecord],
    bag_begin: usize,
    bag_end: usize,
    mods: &[ModRecord],
    gens: &[GenRecord],
    terminal: GeneratorType,
    what: &'static str,
) -> Result<Vec<Zone>, SynthError> {
    if bag_begin > bag_end {
        return Err(SynthError::NonMonotonicIndices("bag"));
    }
    if bag_end >= bags.len() {
        return Err(SynthError::Truncated(what));
    }

    let mut zones = Vec::new();
    let mut global_zone = Zone::default();

    for bag_i in bag_begin..bag_end {
        let mut zone = Zone::default();
        let bag = &bags[bag_i];
        let next_bag = &bags[bag_i + 1];

        let begin_mod = bag.mod_index as usize;
        let end_mod = next_bag.mod_index as usize;
        if begin_mod > end_mod {
            return Err(SynthError::NonMonotonicIndices("modulator"));
        }
        if end_mod > mods.len() {
            return Err(SynthError::Truncated(what));
        }
        for record in &mods[begin_mod..end_mod] {
            if let Some(param) = record.to_param() {
                zone.modulators.append(param);
            }
        }

        let begin_gen = bag.gen_index as usize;
        let end_gen = next_bag.gen_index as usize;
        if begin_gen > end_gen {
            return Err(SynthError::NonMonotonicIndices("generator"));
        }
        if end_gen > gens.len() {
            return Err(SynthError::Truncated(what));
        }
        for record in &gens[begin_gen..end_gen] {
            match GeneratorType::from_repr(record.oper) {
                Some(GeneratorType::KeyRange) => zone.key_range = record.range(),
                Some(GeneratorType::VelocityRange) => zone.velocity_range = record.range(),
                _ => {
                    if (record.oper as usize) < GeneratorType::EndOperator as usize {
                        zone.generators.set_index(record.oper as usize, record.signed_amount());
                    }
                }
            }
        }

        let ends_in_terminal = begin_gen != end_gen && gens[end_gen - 1].oper == terminal as u16;
        if ends_in_terminal {
            zones.push(zone);
        } else if bag_i == bag_begin && (begin_gen != end_gen || begin_mod != end_mod) {
            global_zone = zone;
        } else if begin_gen != end_gen || begin_mod != end_mod {
            debug!(what, "zone without terminal generator ignored");
        }
    }

    for zone in &mut zones {
        zone.generators.merge(&global_zone.generators);
        zone.modulators.merge(&global_zone.modulators);
    }
    Ok(zones)
}

/// A parsed SoundFont 2 bank: the shared PCM pool plus the queryable
/// preset → instrument → sample articulation model.
pub struct SoundFont {
    pub info: BankInfo,
    sample_buffer: Arc<Vec<i16>>,
    samples: Vec<Sample>,
    instruments: Vec<Instrument>,
    presets: Vec<Preset>,
    preset_index: IndexMap<(u16, u16), usize>,
}

impl SoundFont {
    pub fn parse(source: &mut ByteSource) -> Result<SoundFont, SynthError> {
        let riff_header = read_chunk_header(source)?;
        let riff_type = read_four_cc(source)?;
        if &riff_header.id != b"RIFF" || &riff_type != b"sfbk" {
            return Err(SynthError::NotSoundFont);
        }

        let mut info = BankInfo::default();
        let mut sample_buffer: Vec<i16> = Vec::new();
        let mut pdta: Option<PdtaLists> = None;

        let mut walked = 0u64;
        while walked + 4 < riff_header.size as u64 {
            let chunk = read_chunk_header(source)?;
            walked += 8 + chunk.size as u64;
            match &chunk.id {
                b"LIST" => {
                    if chunk.size < 4 {
                        return Err(SynthError::Truncated("LIST chunk"));
                    }
                    let chunk_type = read_four_cc(source)?;
                    let chunk_size = chunk.size - 4;
                    match &chunk_type {
                        b"INFO" => read_info_chunk(source, chunk_size, &mut info)?,
                        b"sdta" => sample_buffer = read_sdta_chunk(source, chunk_size)?,
                        b"pdta" => pdta = Some(read_pdta_chunk(source, chunk_size)?),
                        _ => {
                            source.seek(SeekFrom::Current(chunk_size as i64))?;
                        }
                    }
                }
                _ => {
                    source.seek(SeekFrom::Current(chunk.size as i64))?;
                }
            }
        }

        if sample_buffer.is_empty() {
            return Err(SynthError::MissingSampleData);
        }
        let lists = pdta.ok_or(SynthError::MissingRecords("preset data"))?;
        SoundFont::build(info, sample_buffer, lists)
    }

    fn build(info: BankInfo, sample_buffer: Vec<i16>, lists: PdtaLists) -> Result<SoundFont, SynthError> {
        // the last record of phdr, inst, and shdr is a required terminator
        if lists.inst.len() < 2 {
            return Err(SynthError::MissingRecords("instrument"));
        }
        let mut instruments = Vec::with_capacity(lists.inst.len() - 1);
        for window in lists.inst.windows(2) {
            let zones = read_bags(
                &lists.ibag,
                window[0].bag_index as usize,
                window[1].bag_index as usize,
                &lists.imod,
                &lists.igen,
                GeneratorType::SampleId,
                "instrument zones",
            )?;
            instruments.push(Instrument { name: record_name(&window[0].name), zones });
        }

        if lists.phdr.len() < 2 {
            return Err(SynthError::MissingRecords("preset"));
        }
        let mut presets = Vec::with_capacity(lists.phdr.len() - 1);
        let mut preset_index = IndexMap::new();
        for window in lists.phdr.windows(2) {
            let zones = read_bags(
                &lists.pbag,
                window[0].bag_index as usize,
                window[1].bag_index as usize,
                &lists.pmod,
                &lists.pgen,
                GeneratorType::Instrument,
                "preset zones",
            )?;
            let preset = Preset {
                name: record_name(&window[0].name),
                bank: window[0].bank,
                preset_id: window[0].preset,
                zones,
            };
            preset_index.entry((preset.bank, preset.preset_id)).or_insert(presets.len());
            presets.push(preset);
        }

        if lists.shdr.len() < 2 {
            return Err(SynthError::MissingRecords("sample"));
        }
        let mut samples = Vec::with_capacity(lists.shdr.len() - 1);
        for record in &lists.shdr[..lists.shdr.len() - 1] {
            samples.push(Sample::from_record(record, &sample_buffer)?);
        }

        debug!(
            presets = presets.len(),
            instruments = instruments.len(),
            samples = samples.len(),
            frames = sample_buffer.len(),
            "bank loaded"
        );

        Ok(SoundFont {
            info,
            sample_buffer: Arc::new(sample_buffer),
            samples,
            instruments,
            presets,
            preset_index,
        })
    }

    pub fn sample_buffer(&self) -> &Arc<Vec<i16>> {
        &self.sample_buffer
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn instruments(&self) -> &[Instrument] {
        &self.instruments
    }

    pub fn presets(&self) -> &[Preset] {
        &self.presets
    }

    /// Index of the first preset with this exact `(bank, program)` address,
    /// in file order.
    pub fn preset_at(&self, bank: u16, preset_id: u16) -> Option<usize> {
        self.preset_index.get(&(bank, preset_id)).copied()
    }

    /// Serializable bank summary, in file order, for inspection tooling.
    pub fn listing(&self) -> BankListing {
        BankListing {
            info: self.info.clone(),
            presets: self
                .preset_index
                .values()
                .map(|&index| {
                    let preset = &self.presets[index];
                    PresetListing {
                        name: preset.name.clone(),
                        bank: preset.bank,
                        program: preset.preset_id,
                        zones: preset.zones.len(),
                    }
                })
                .collect(),
            instruments: self
                .instruments
                .iter()
                .map(|instrument| InstrumentListing {
                    name: instrument.name.clone(),
                    zones: instrument.zones.len(),
                })
                .collect(),
            samples: self
                .samples
                .iter()
                .map(|sample| SampleListing {
                    name: sample.name.clone(),
                    sample_rate: sample.sample_rate,
                    root_key: sample.key,
                    frames: sample.end.saturating_sub(sample.start),
                    disabled: sample.is_disabled(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PresetListing {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@bank")]
    pub bank: u16,
    #[serde(rename = "@program")]
    pub program: u16,
    #[serde(rename = "@zones")]
    pub zones: usize,
}

#[derive(Debug, Serialize)]
pub struct InstrumentListing {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@zones")]
    pub zones: usize,
}

#[derive(Debug, Serialize)]
pub struct SampleListing {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@rate")]
    pub sample_rate: u32,
    #[serde(rename = "@root_key")]
    pub root_key: i8,
    #[serde(rename = "@frames")]
    pub frames: u32,
    #[serde(rename = "@disabled")]
    pub disabled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename = "soundfont")]
pub struct BankListing {
    pub info: BankInfo,
    #[serde(rename = "preset")]
    pub presets: Vec<PresetListing>,
    #[serde(rename = "instrument")]
    pub instruments: Vec<InstrumentListing>,
    #[serde(rename = "sample")]
    pub samples: Vec<SampleListing>,
}

struct PdtaLists {
    phdr: Vec<PresetHeaderRecord>,
    pbag: Vec<BagRecord>,
    pmod: Vec<ModRecord>,
    pgen: Vec<GenRecord>,
    inst: Vec<InstRecord>,
    ibag: Vec<BagRecord>,
    imod: Vec<ModRecord>,
    igen: Vec<GenRecord>,
    shdr: Vec<SampleRecord>,
}

fn read_info_chunk(source: &mut ByteSource, size: u32, info: &mut BankInfo) -> Result<(), SynthError> {
    let mut walked = 0u64;
    while walked < size as u64 {
        let subchunk = read_chunk_header(source)?;
        walked += 8 + subchunk.size as u64;
        match &subchunk.id {
            b"ifil" => {
                info.version_major = source.read_u16::<LittleEndian>()?;
                info.version_minor = source.read_u16::<LittleEndian>()?;
                if info.version_major > 2 || info.version_minor > 4 {
                    return Err(SynthError::UnsupportedVersion(info.version_major, info.version_minor));
                }
            }
            b"INAM" => info.name = read_info_string(source, subchunk.size)?,
            b"IENG" => info.engineers = read_info_string(source, subchunk.size)?,
            b"IPRD" => info.product = read_info_string(source, subchunk.size)?,
            b"ICOP" => info.copyright = read_info_string(source, subchunk.size)?,
            b"ICRD" => info.creation_date = read_info_string(source, subchunk.size)?,
            b"ICMT" => info.comments = read_info_string(source, subchunk.size)?,
            b"ISFT" => info.tools = read_info_string(source, subchunk.size)?,
            _ => {
                source.seek(SeekFrom::Current(subchunk.size as i64))?;
            }
        }
    }
    Ok(())
}

fn read_sdta_chunk(source: &mut ByteSource, size: u32) -> Result<Vec<i16>, SynthError> {
    let mut sample_buffer = Vec::new();
    let mut walked = 0u64;
    while walked < size as u64 {
        let subchunk = read_chunk_header(source)?;
        walked += 8 + subchunk.size as u64;
        match &subchunk.id {
            b"smpl" => {
                if subchunk.size == 0 {
                    return Err(SynthError::MissingSampleData);
                }
                sample_buffer = vec![0i16; subchunk.size as usize / 2];
                source
                    .read_i16_into::<LittleEndian>(&mut sample_buffer)
                    .map_err(|_| SynthError::Truncated("sample data"))?;
            }
            _ => {
                source.seek(SeekFrom::Current(subchunk.size as i64))?;
            }
        }
    }
    Ok(sample_buffer)
}

fn read_pdta_chunk(source: &mut ByteSource, size: u32) -> Result<PdtaLists, SynthError> {
    let mut phdr = Vec::new();
    let mut pbag = Vec::new();
    let mut pmod = Vec::new();
    let mut pgen = Vec::new();
    let mut inst = Vec::new();
    let mut ibag = Vec::new();
    let mut imod = Vec::new();
    let mut igen = Vec::new();
    let mut shdr = Vec::new();

    let mut walked = 0u64;
    while walked < size as u64 {
        let subchunk = read_chunk_header(source)?;
        walked += 8 + subchunk.size as u64;
        match &subchunk.id {
            b"phdr" => phdr = read_record_list(source, subchunk.size, "preset headers")?,
            b"pbag" => pbag = read_record_list(source, subchunk.size, "preset bags")?,
            b"pmod" => pmod = read_record_list(source, subchunk.size, "preset modulators")?,
            b"pgen" => pgen = read_record_list(source, subchunk.size, "preset generators")?,
            b"inst" => inst = read_record_list(source, subchunk.size, "instrument headers")?,
            b"ibag" => ibag = read_record_list(source, subchunk.size, "instrument bags")?,
            b"imod" => imod = read_record_list(source, subchunk.size, "instrument modulators")?,
            b"igen" => igen = read_record_list(source, subchunk.size, "instrument generators")?,
            b"shdr" => shdr = read_record_list(source, subchunk.size, "sample headers")?,
            _ => {
                source.seek(SeekFrom::Current(subchunk.size as i64))?;
            }
        }
    }

    Ok(PdtaLists { phdr, pbag, pmod, pgen, inst, ibag, imod, igen, shdr })
}

#![allow(dead_code)]

use byteorder::{LittleEndian, WriteBytesExt};
use midly::num::{u14, u15, u24, u28, u4, u7};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};

use sfsynth::Synthesizer;

pub const DIVISION: u16 = 480;
pub const SINE_PERIOD: usize = 100;
pub const SINE_FRAMES: u32 = 1900;

/// One `(bank, program)` preset backed by a single full-range zone over the
/// shared sine sample.
#[derive(Clone, Copy)]
pub struct PresetSpec {
    pub bank: u16,
    pub program: u16,
    /// SF2 sampleModes bits: 0 unlooped, 1 looped, 3 looped-until-release.
    pub sample_mode: i16,
    pub exclusive_class: i16,
    pub release_vol_env: i16,
}

impl Default for PresetSpec {
    fn default() -> PresetSpec {
        PresetSpec {
            bank: 0,
            program: 0,
            sample_mode: 1,
            exclusive_class: 0,
            release_vol_env: -12000,
        }
    }
}

fn sub_chunk(out: &mut Vec<u8>, id: &[u8; 4], body: &[u8]) {
    out.extend_from_slice(id);
    out.write_u32::<LittleEndian>(body.len() as u32).unwrap();
    out.extend_from_slice(body);
}

fn list_chunk(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(body.len() + 4);
    inner.extend_from_slice(kind);
    inner.extend_from_slice(body);
    let mut out = Vec::with_capacity(inner.len() + 8);
    sub_chunk(&mut out, b"LIST", &inner);
    out
}

fn record_name(name: &str) -> [u8; 20] {
    let mut out = [0u8; 20];
    for (slot, byte) in out.iter_mut().zip(name.bytes()) {
        *slot = byte;
    }
    out
}

/// Build a complete in-memory SF2 with one shared sine sample (period
/// `SINE_PERIOD` frames, so 441 Hz at 44100) and one preset per spec.
pub fn sine_test_font(presets: &[PresetSpec]) -> Vec<u8> {
    let n = presets.len();

    // INFO: version plus a name string
    let mut info = Vec::new();
    let mut ifil = Vec::new();
    ifil.write_u16::<LittleEndian>(2).unwrap();
    ifil.write_u16::<LittleEndian>(4).unwrap();
    sub_chunk(&mut info, b"ifil", &ifil);
    sub_chunk(&mut info, b"INAM", b"Test Bank\0");
    let info_list = list_chunk(b"INFO", &info);

    // sdta: 1900 sine frames plus guard zeroes
    let mut pcm = Vec::new();
    for i in 0..SINE_FRAMES as usize {
        let phase = (i % SINE_PERIOD) as f32 / SINE_PERIOD as f32;
        let value = (phase * std::f32::consts::TAU).sin() * 16000.0;
        pcm.write_i16::<LittleEndian>(value as i16).unwrap();
    }
    for _ in 0..100 {
        pcm.write_i16::<LittleEndian>(0).unwrap();
    }
    let mut sdta = Vec::new();
    sub_chunk(&mut sdta, b"smpl", &pcm);
    let sdta_list = list_chunk(b"sdta", &sdta);

    // pdta: hydra records with one instrument (and one zone) per preset
    let mut phdr = Vec::new();
    for (i, spec) in presets.iter().enumerate() {
        phdr.extend_from_slice(&record_name(&format!("Preset {}", i)));
        phdr.write_u16::<LittleEndian>(spec.program).unwrap();
        phdr.write_u16::<LittleEndian>(spec.bank).unwrap();
        phdr.write_u16::<LittleEndian>(i as u16).unwrap();
        phdr.write_u32::<LittleEndian>(0).unwrap();
        phdr.write_u32::<LittleEndian>(0).unwrap();
        phdr.write_u32::<LittleEndian>(0).unwrap();
    }
    phdr.extend_from_slice(&record_name("EOP"));
    phdr.write_u16::<LittleEndian>(0).unwrap();
    phdr.write_u16::<LittleEndian>(0).unwrap();
    phdr.write_u16::<LittleEndian>(n as u16).unwrap();
    phdr.write_u32::<LittleEndian>(0).unwrap();
    phdr.write_u32::<LittleEndian>(0).unwrap();
    phdr.write_u32::<LittleEndian>(0).unwrap();

    let mut pbag = Vec::new();
    for i in 0..=n {
        pbag.write_u16::<LittleEndian>(i as u16).unwrap();
        pbag.write_u16::<LittleEndian>(0).unwrap();
    }

    let mut pmod = Vec::new();
    pmod.extend_from_slice(&[0u8; 10]);

    let mut pgen = Vec::new();
    for i in 0..n {
        pgen.write_u16::<LittleEndian>(41).unwrap(); // instrument
        pgen.write_i16::<LittleEndian>(i as i16).unwrap();
    }
    pgen.extend_from_slice(&[0u8; 4]);

    let mut inst = Vec::new();
    for i in 0..n {
        inst.extend_from_slice(&record_name(&format!("Inst {}", i)));
        inst.write_u16::<LittleEndian>(i as u16).unwrap();
    }
    inst.extend_from_slice(&record_name("EOI"));
    inst.write_u16::<LittleEndian>(n as u16).unwrap();

    const GENS_PER_ZONE: usize = 4;
    let mut ibag = Vec::new();
    for i in 0..=n {
        ibag.write_u16::<LittleEndian>((i * GENS_PER_ZONE) as u16).unwrap();
        ibag.write_u16::<LittleEndian>(0).unwrap();
    }

    let mut imod = Vec::new();
    imod.extend_from_slice(&[0u8; 10]);

    let mut igen = Vec::new();
    for spec in presets {
        igen.write_u16::<LittleEndian>(54).unwrap(); // sampleModes
        igen.write_i16::<LittleEndian>(spec.sample_mode).unwrap();
        igen.write_u16::<LittleEndian>(57).unwrap(); // exclusiveClass
        igen.write_i16::<LittleEndian>(spec.exclusive_class).unwrap();
        igen.write_u16::<LittleEndian>(38).unwrap(); // releaseVolEnv
        igen.write_i16::<LittleEndian>(spec.release_vol_env).unwrap();
        igen.write_u16::<LittleEndian>(53).unwrap(); // sampleID
        igen.write_i16::<LittleEndian>(0).unwrap();
    }
    igen.extend_from_slice(&[0u8; 4]);

    let mut shdr = Vec::new();
    shdr.extend_from_slice(&record_name("sine"));
    shdr.write_u32::<LittleEndian>(0).unwrap(); // start
    shdr.write_u32::<LittleEndian>(SINE_FRAMES).unwrap(); // end
    shdr.write_u32::<LittleEndian>(0).unwrap(); // start loop
    shdr.write_u32::<LittleEndian>(SINE_FRAMES).unwrap(); // end loop
    shdr.write_u32::<LittleEndian>(44100).unwrap();
    shdr.write_i8(69).unwrap();
    shdr.write_i8(0).unwrap();
    shdr.write_u16::<LittleEndian>(0).unwrap();
    shdr.write_u16::<LittleEndian>(1).unwrap(); // mono
    shdr.extend_from_slice(&record_name("EOS"));
    shdr.extend_from_slice(&[0u8; 26]);

    let mut pdta = Vec::new();
    sub_chunk(&mut pdta, b"phdr", &phdr);
    sub_chunk(&mut pdta, b"pbag", &pbag);
    sub_chunk(&mut pdta, b"pmod", &pmod);
    sub_chunk(&mut pdta, b"pgen", &pgen);
    sub_chunk(&mut pdta, b"inst", &inst);
    sub_chunk(&mut pdta, b"ibag", &ibag);
    sub_chunk(&mut pdta, b"imod", &imod);
    sub_chunk(&mut pdta, b"igen", &igen);
    sub_chunk(&mut pdta, b"shdr", &shdr);
    let pdta_list = list_chunk(b"pdta", &pdta);

    let mut riff_body = Vec::new();
    riff_body.extend_from_slice(b"sfbk");
    riff_body.extend_from_slice(&info_list);
    riff_body.extend_from_slice(&sdta_list);
    riff_body.extend_from_slice(&pdta_list);

    let mut out = Vec::new();
    sub_chunk(&mut out, b"RIFF", &riff_body);
    out
}

pub fn default_test_font() -> Vec<u8> {
    sine_test_font(&[PresetSpec::default()])
}

pub fn smf_bytes(tracks: Vec<Vec<TrackEvent>>) -> Vec<u8> {
    let format = if tracks.len() > 1 { Format::Parallel } else { Format::SingleTrack };
    let smf = Smf {
        header: Header::new(format, Timing::Metrical(u15::new(DIVISION))),
        tracks,
    };
    let mut out = Vec::new();
    smf.write_std(&mut out).unwrap();
    out
}

pub fn ev(delta: u32, kind: TrackEventKind) -> TrackEvent {
    TrackEvent { delta: u28::new(delta), kind }
}

pub fn program_change(channel: u8, program: u8) -> TrackEventKind<'static> {
    TrackEventKind::Midi {
        channel: u4::new(channel),
        message: MidiMessage::ProgramChange { program: u7::new(program) },
    }
}

pub fn note_on(channel: u8, key: u8, velocity: u8) -> TrackEventKind<'static> {
    TrackEventKind::Midi {
        channel: u4::new(channel),
        message: MidiMessage::NoteOn { key: u7::new(key), vel: u7::new(velocity) },
    }
}

pub fn note_off(channel: u8, key: u8) -> TrackEventKind<'static> {
    TrackEventKind::Midi {
        channel: u4::new(channel),
        message: MidiMessage::NoteOff { key: u7::new(key), vel: u7::new(0) },
    }
}

pub fn controller(channel: u8, controller: u8, value: u8) -> TrackEventKind<'static> {
    TrackEventKind::Midi {
        channel: u4::new(channel),
        message: MidiMessage::Controller { controller: u7::new(controller), value: u7::new(value) },
    }
}

pub fn pitch_bend(channel: u8, value: u16) -> TrackEventKind<'static> {
    TrackEventKind::Midi {
        channel: u4::new(channel),
        message: MidiMessage::PitchBend { bend: midly::PitchBend(u14::new(value)) },
    }
}

pub fn marker(text: &'static str) -> TrackEventKind<'static> {
    TrackEventKind::Meta(MetaMessage::Marker(text.as_bytes()))
}

pub fn tempo(microseconds_per_quarter: u32) -> TrackEventKind<'static> {
    TrackEventKind::Meta(MetaMessage::Tempo(u24::new(microseconds_per_quarter)))
}

pub fn end_of_track() -> TrackEventKind<'static> {
    TrackEventKind::Meta(MetaMessage::EndOfTrack)
}

/// Pull `frames` frames in one call and return the interleaved f32 samples
/// actually produced.
pub fn render_frames(synth: &mut Synthesizer, frames: usize) -> Vec<f32> {
    let mut buffer = vec![0u8; frames * 8];
    let written = synth.play_stream(&mut buffer);
    buffer[..written]
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Render chunk by chunk until the stream dries up (or a safety cap).
pub fn render_to_end(synth: &mut Synthesizer, chunk_frames: usize, max_frames: usize) -> Vec<f32> {
    let mut all = Vec::new();
    while all.len() / 2 < max_frames {
        let samples = render_frames(synth, chunk_frames);
        if samples.is_empty() {
            break;
        }
        all.extend_from_slice(&samples);
    }
    all
}

pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |acc, &sample| acc.max(sample.abs()))
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Rough frequency estimate of the left channel by zero-crossing count.
pub fn left_channel_frequency(samples: &[f32], sample_rate: f32) -> f32 {
    let left: Vec<f32> = samples.iter().step_by(2).copied().collect();
    let mut crossings = 0usize;
    for pair in left.windows(2) {
        if (pair[0] <= 0.0 && pair[1] > 0.0) || (pair[0] >= 0.0 && pair[1] < 0.0) {
            crossings += 1;
        }
    }
    crossings as f32 / 2.0 * sample_rate / left.len() as f32
}

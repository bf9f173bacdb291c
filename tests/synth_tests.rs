mod common;

use common::*;
use midly::TrackEvent;
use sfsynth::Synthesizer;

fn loaded_synth(voices: usize, song: &[u8]) -> Synthesizer {
    let mut synth = Synthesizer::new(44100.0, voices);
    assert!(synth.load_soundfont_bytes(&default_test_font()));
    assert!(synth.load_song_bytes(song));
    synth
}

fn one_second_note_song() -> Vec<u8> {
    // program change, note-on A4, one second (960 ticks at 120 bpm), note-off
    let track: Vec<TrackEvent> = vec![
        ev(0, program_change(0, 0)),
        ev(0, note_on(0, 69, 100)),
        ev(960, note_off(0, 69)),
        ev(0, end_of_track()),
    ];
    smf_bytes(vec![track])
}

// --- A loaded bank without a song renders pure silence ---
#[test]
fn silence_without_song() {
    let mut synth = Synthesizer::new(44100.0, 16);
    assert!(synth.load_soundfont_bytes(&default_test_font()));

    let mut buffer = vec![0x55u8; 44100 * 8];
    let written = synth.play_stream(&mut buffer);
    assert_eq!(written, 352800);
    assert!(buffer.iter().all(|&byte| byte == 0));
}

#[test]
fn note_produces_audio_then_decays_to_silence() {
    let mut synth = loaded_synth(16, &one_second_note_song());
    let samples = render_to_end(&mut synth, 4410, 44100 * 4);

    let total_seconds = samples.len() as f64 / 2.0 / 44100.0;
    // one second of note plus the one second post-song delay
    assert!(
        (1.8..2.3).contains(&total_seconds),
        "rendered {} s",
        total_seconds
    );

    assert!(peak(&samples[..8820]) > 0.01, "note should be audible early");
    let tail = &samples[samples.len() - 8820..];
    assert!(peak(tail) < 1e-5, "tail should be silent, peak {}", peak(tail));
}

#[test]
fn rewind_then_render_matches_fresh_render() {
    let song = one_second_note_song();

    let mut fresh = loaded_synth(16, &song);
    let expected = render_frames(&mut fresh, 44100);

    let mut rewound = loaded_synth(16, &song);
    rewound.rewind();
    let actual = render_frames(&mut rewound, 44100);

    assert_eq!(expected, actual);
}

#[test]
fn reset_and_rewind_replay_from_the_start() {
    let song = one_second_note_song();

    let mut fresh = loaded_synth(16, &song);
    let expected = render_frames(&mut fresh, 22050);

    let mut reused = loaded_synth(16, &song);
    render_frames(&mut reused, 11025);
    reused.reset();
    reused.rewind();
    let actual = render_frames(&mut reused, 22050);

    assert_eq!(expected, actual);
}

// --- Three simultaneous notes on a two-voice pool steal the oldest ---
#[test]
fn voice_stealing_caps_polyphony() {
    let track: Vec<TrackEvent> = vec![
        ev(0, program_change(0, 0)),
        ev(0, note_on(0, 60, 100)),
        ev(0, note_on(0, 62, 100)),
        ev(0, note_on(0, 64, 100)),
        ev(480, end_of_track()),
    ];
    let mut synth = loaded_synth(2, &smf_bytes(vec![track]));

    render_frames(&mut synth, 512);
    assert_eq!(synth.active_voice_count(), 2);
}

// --- loopstart/loopend markers with a loop count of 2 play thrice ---
#[test]
fn loop_markers_repeat_the_region() {
    let track: Vec<TrackEvent> = vec![
        ev(0, program_change(0, 0)),
        ev(0, marker("loopstart")),
        ev(0, note_on(0, 69, 100)),
        ev(480, note_off(0, 69)),
        ev(0, marker("loopend")),
        ev(0, end_of_track()),
    ];
    let mut synth = loaded_synth(16, &smf_bytes(vec![track]));
    synth.set_loop_enabled(true);
    synth.set_loop_count(2);

    let samples = render_to_end(&mut synth, 4410, 44100 * 8);
    let total_seconds = samples.len() as f64 / 2.0 / 44100.0;
    // three passes over the half-second region plus the post-song delay
    assert!(
        (2.25..2.75).contains(&total_seconds),
        "rendered {} s",
        total_seconds
    );
}

// --- Hi-hat style exclusive class: the second hit chokes the first ---
#[test]
fn exclusive_class_keeps_one_voice_sounding() {
    let font = sine_test_font(&[PresetSpec {
        bank: 128,
        program: 0,
        exclusive_class: 1,
        ..PresetSpec::default()
    }]);
    let track: Vec<TrackEvent> = vec![
        ev(0, program_change(9, 0)),
        ev(0, note_on(9, 42, 100)),
        ev(48, note_on(9, 42, 100)),
        ev(960, end_of_track()),
    ];
    let mut synth = Synthesizer::new(44100.0, 16);
    assert!(synth.load_soundfont_bytes(&font));
    assert!(synth.load_song_bytes(&smf_bytes(vec![track])));

    render_frames(&mut synth, 8820);
    assert_eq!(synth.playing_voice_count(), 1);
}

// --- RPN 0 at 24 semitones plus a full bend lands ~2 octaves up ---
#[test]
fn pitch_bend_sensitivity_scales_pitch() {
    let unbent: Vec<TrackEvent> = vec![
        ev(0, program_change(0, 0)),
        ev(0, note_on(0, 69, 127)),
        ev(1920, note_off(0, 69)),
        ev(0, end_of_track()),
    ];
    let mut synth = loaded_synth(16, &smf_bytes(vec![unbent]));
    let samples = render_frames(&mut synth, 44100);
    let base = left_channel_frequency(&samples[26460..70560], 44100.0);
    assert!((400.0..480.0).contains(&base), "base frequency {}", base);

    let bent: Vec<TrackEvent> = vec![
        ev(0, program_change(0, 0)),
        ev(0, controller(0, 101, 0)),
        ev(0, controller(0, 100, 0)),
        ev(0, controller(0, 6, 24)),
        ev(0, controller(0, 38, 0)),
        ev(0, pitch_bend(0, 16383)),
        ev(0, note_on(0, 69, 127)),
        ev(1920, note_off(0, 69)),
        ev(0, end_of_track()),
    ];
    let mut synth = loaded_synth(16, &smf_bytes(vec![bent]));
    let samples = render_frames(&mut synth, 44100);
    let shifted = left_channel_frequency(&samples[26460..70560], 44100.0);

    let ratio = shifted / base;
    assert!((3.5..4.4).contains(&ratio), "bend ratio {}", ratio);
}

#[test]
fn missing_program_falls_back_to_piano() {
    let track: Vec<TrackEvent> = vec![
        ev(0, program_change(0, 25)),
        ev(0, note_on(0, 69, 100)),
        ev(960, note_off(0, 69)),
        ev(0, end_of_track()),
    ];
    let mut synth = loaded_synth(16, &smf_bytes(vec![track]));
    let samples = render_frames(&mut synth, 22050);
    assert!(peak(&samples) > 0.01, "fallback preset should sound");
}

#[test]
fn sustain_pedal_holds_released_notes() {
    let track: Vec<TrackEvent> = vec![
        ev(0, program_change(0, 0)),
        ev(0, controller(0, 64, 127)),
        ev(0, note_on(0, 69, 100)),
        ev(480, note_off(0, 69)),
        ev(480, controller(0, 64, 0)),
        ev(0, end_of_track()),
    ];
    let mut synth = loaded_synth(16, &smf_bytes(vec![track]));
    let samples = render_to_end(&mut synth, 4410, 44100 * 4);

    // held by the pedal between note-off (0.5 s) and pedal-up (1.0 s)
    let held = &samples[2 * 26460..2 * 39690];
    assert!(rms(held) > 1e-3, "pedal should hold the note, rms {}", rms(held));

    let tail = &samples[samples.len() - 8820..];
    assert!(peak(tail) < 1e-5, "note should fall silent after pedal up");
}

#[test]
fn disabled_sample_never_sounds() {
    let mut font = sine_test_font(&[PresetSpec::default()]);
    // invert the sample range: find shdr and zero the end offset
    let shdr = font
        .windows(4)
        .rposition(|window| window == b"shdr")
        .expect("built font has a shdr chunk");
    let end_offset = shdr + 8 + 20 + 4;
    font[end_offset..end_offset + 4].copy_from_slice(&0u32.to_le_bytes());

    let mut synth = Synthesizer::new(44100.0, 16);
    assert!(synth.load_soundfont_bytes(&font));
    assert!(synth.load_song_bytes(&one_second_note_song()));

    let samples = render_frames(&mut synth, 22050);
    assert_eq!(synth.playing_voice_count(), 0);
    assert!(peak(&samples) < 1e-6, "disabled sample must be silent");
}

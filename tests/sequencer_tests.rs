mod common;

use common::*;
use midly::TrackEvent;
use sfsynth::Synthesizer;

fn synth_with_font() -> Synthesizer {
    let mut synth = Synthesizer::new(44100.0, 16);
    assert!(synth.load_soundfont_bytes(&default_test_font()));
    synth
}

fn rendered_seconds(samples: &[f32]) -> f64 {
    samples.len() as f64 / 2.0 / 44100.0
}

#[test]
fn song_length_includes_post_song_delay() {
    let track: Vec<TrackEvent> = vec![
        ev(0, program_change(0, 0)),
        ev(0, note_on(0, 69, 100)),
        ev(960, note_off(0, 69)),
        ev(0, end_of_track()),
    ];
    let mut synth = synth_with_font();
    assert!(synth.load_song_bytes(&smf_bytes(vec![track])));
    let length = synth.song_length_seconds();
    assert!((1.9..2.1).contains(&length), "song length {}", length);
}

#[test]
fn tempo_change_rescales_tick_time() {
    // 960 ticks at 250000 us per quarter is half a second
    let track: Vec<TrackEvent> = vec![
        ev(0, tempo(250_000)),
        ev(0, program_change(0, 0)),
        ev(0, note_on(0, 69, 100)),
        ev(960, note_off(0, 69)),
        ev(0, end_of_track()),
    ];
    let mut synth = synth_with_font();
    assert!(synth.load_song_bytes(&smf_bytes(vec![track])));

    let samples = render_to_end(&mut synth, 4410, 44100 * 4);
    let seconds = rendered_seconds(&samples);
    assert!((1.35..1.7).contains(&seconds), "rendered {} s", seconds);
}

#[test]
fn tempo_multiplier_slows_playback() {
    let track: Vec<TrackEvent> = vec![
        ev(0, program_change(0, 0)),
        ev(0, note_on(0, 69, 100)),
        ev(960, note_off(0, 69)),
        ev(0, end_of_track()),
    ];
    let mut synth = synth_with_font();
    assert!(synth.load_song_bytes(&smf_bytes(vec![track])));
    // half-speed wall clock: every queued delay, including the post-song
    // one, takes twice as long to drain
    synth.set_tempo_multiplier(0.5);

    let samples = render_to_end(&mut synth, 4410, 44100 * 6);
    let seconds = rendered_seconds(&samples);
    assert!((3.6..4.4).contains(&seconds), "rendered {} s", seconds);
}

#[test]
fn nested_loop_stack_repeats_region() {
    let track: Vec<TrackEvent> = vec![
        ev(0, program_change(0, 0)),
        ev(0, marker("loopstart=2")),
        ev(0, note_on(0, 69, 100)),
        ev(480, note_off(0, 69)),
        ev(0, marker("loopend=")),
        ev(0, end_of_track()),
    ];
    let mut synth = synth_with_font();
    assert!(synth.load_song_bytes(&smf_bytes(vec![track])));
    synth.set_loop_enabled(true);
    synth.set_loop_count(0);

    let samples = render_to_end(&mut synth, 4410, 44100 * 8);
    let seconds = rendered_seconds(&samples);
    // the half-second region twice, plus the post-song delay
    assert!((1.75..2.3).contains(&seconds), "rendered {} s", seconds);
}

#[test]
fn at_end_reports_and_rewind_clears() {
    let track: Vec<TrackEvent> = vec![
        ev(0, program_change(0, 0)),
        ev(0, note_on(0, 69, 100)),
        ev(480, note_off(0, 69)),
        ev(0, end_of_track()),
    ];
    let mut synth = synth_with_font();
    assert!(synth.load_song_bytes(&smf_bytes(vec![track])));

    render_to_end(&mut synth, 4410, 44100 * 4);
    assert!(synth.at_end());

    synth.rewind();
    assert!(!synth.at_end());
    let samples = render_frames(&mut synth, 4410);
    assert!(!samples.is_empty());
}

#[test]
fn multi_track_songs_merge_by_time() {
    // track order must not matter for audibility: notes on two tracks
    let track_one: Vec<TrackEvent> = vec![
        ev(0, program_change(0, 0)),
        ev(0, note_on(0, 69, 100)),
        ev(960, note_off(0, 69)),
        ev(0, end_of_track()),
    ];
    let track_two: Vec<TrackEvent> = vec![
        ev(0, program_change(1, 0)),
        ev(480, note_on(1, 60, 100)),
        ev(480, note_off(1, 60)),
        ev(0, end_of_track()),
    ];
    let mut synth = synth_with_font();
    assert!(synth.load_song_bytes(&smf_bytes(vec![track_one, track_two])));

    let samples = render_to_end(&mut synth, 4410, 44100 * 4);
    let seconds = rendered_seconds(&samples);
    assert!((1.8..2.3).contains(&seconds), "rendered {} s", seconds);
    assert!(peak(&samples[..8820]) > 0.01);
    // overlap region with both notes sounding
    assert!(peak(&samples[2 * 26460..2 * 39690]) > 0.01);
}

#[test]
fn gmf_songs_load_with_fixed_divisor() {
    let mut data = b"GMF\x01\x00\x00\x00".to_vec();
    // delta 0, program change, then a note spanning 192 ticks
    data.extend_from_slice(&[0x00, 0xC0, 0x00]);
    data.extend_from_slice(&[0x00, 0x90, 69, 100]);
    data.extend_from_slice(&[0x81, 0x40, 0x80, 69, 0, 0x00]);

    let mut synth = synth_with_font();
    assert!(synth.load_song_bytes(&data));
    let samples = render_to_end(&mut synth, 4410, 44100 * 4);
    assert!(peak(&samples) > 0.01, "GMF note should sound");
}

#[test]
fn rsxx_songs_load_from_offset_header() {
    let start = 0x5Dusize;
    let mut data = vec![0u8; start];
    data[0] = start as u8;
    data[start - 0x10..start - 0x10 + 6].copy_from_slice(b"rsxx}u");
    // track data begins at the offset named by the first byte, with no
    // leading delta
    data.extend_from_slice(&[0xC0, 0x00]);
    data.extend_from_slice(&[0x00, 0x90, 69, 100]);
    data.extend_from_slice(&[0x81, 0x40, 0x80, 69, 0]);
    data.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);

    let mut synth = synth_with_font();
    assert!(synth.load_song_bytes(&data));
    let samples = render_to_end(&mut synth, 4410, 44100 * 4);
    assert!(peak(&samples) > 0.01, "RSXX note should sound");
}

#[test]
fn rmi_wrapper_unwraps_to_smf() {
    let track: Vec<TrackEvent> = vec![
        ev(0, program_change(0, 0)),
        ev(0, note_on(0, 69, 100)),
        ev(480, note_off(0, 69)),
        ev(0, end_of_track()),
    ];
    let smf = smf_bytes(vec![track]);

    let mut rmi = Vec::new();
    rmi.extend_from_slice(b"RIFF");
    rmi.extend_from_slice(&((smf.len() + 12) as u32).to_le_bytes());
    rmi.extend_from_slice(b"RMID");
    rmi.extend_from_slice(b"data");
    rmi.extend_from_slice(&(smf.len() as u32).to_le_bytes());
    rmi.extend_from_slice(&smf);

    let mut synth = synth_with_font();
    assert!(synth.load_song_bytes(&rmi));
    let samples = render_to_end(&mut synth, 4410, 44100 * 4);
    assert!(peak(&samples) > 0.01, "RMI note should sound");
}

#[test]
fn mus_songs_convert_and_play() {
    // program change, note-on with velocity and a delta, note-off, end
    let events: &[u8] = &[
        0x40, 0x00, 0x00, // program change to 0
        0x90, 0x80 | 69, 100, 0x46, // note-on with last-bit, delta 70 ticks
        0x00, 69, // note-off
        0x60, // end of score
    ];
    let mut mus = Vec::new();
    mus.extend_from_slice(b"MUS\x1A");
    mus.extend_from_slice(&(events.len() as u16).to_le_bytes());
    mus.extend_from_slice(&8u16.to_le_bytes());
    mus.extend_from_slice(events);

    let mut synth = synth_with_font();
    assert!(synth.load_song_bytes(&mus));
    let samples = render_to_end(&mut synth, 4410, 44100 * 4);
    assert!(peak(&samples) > 0.01, "MUS note should sound");
}

#[test]
fn disabled_channels_are_muted() {
    let track: Vec<TrackEvent> = vec![
        ev(0, program_change(0, 0)),
        ev(0, note_on(0, 69, 100)),
        ev(960, note_off(0, 69)),
        ev(0, end_of_track()),
    ];
    let smf = smf_bytes(vec![track]);
    let mut synth = synth_with_font();
    assert!(synth.load_song_bytes(&smf));
    synth.set_channel_enabled(0, false);

    let samples = render_to_end(&mut synth, 4410, 44100 * 4);
    assert!(peak(&samples) < 1e-6, "disabled channel must stay silent");
}

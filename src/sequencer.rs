pub mod mus;

use tracing::warn;

use crate::channel::NUM_CHANNELS;
use crate::dtype::SynthError;
use crate::synth::{Engine, Standard};

const MIDI_PARSE_HEADER_SIZE: usize = 14;
const SMF_MAGIC: &[u8; 8] = b"MThd\x00\x00\x00\x06";
const TRACK_MAGIC: &[u8; 4] = b"MTrk";
const NOTE_STATE_SLOTS: usize = 16 * 255;

const GM_SYSTEM_ON: &[u8] = &[0xF0, 0x7E, 0, 0x09, 0x01, 0xF7];
const GM_SYSTEM_OFF: &[u8] = &[0xF0, 0x7E, 0, 0x09, 0x02, 0xF7];
const GS_RESET: &[u8] = &[0xF0, 0x41, 0, 0x42, 0x12, 0x40, 0x00, 0x7F, 0x00, 0x41, 0xF7];
const GS_SYSTEM_MODE_SET1: &[u8] = &[0xF0, 0x41, 0, 0x42, 0x12, 0x00, 0x00, 0x7F, 0x00, 0x01, 0xF7];
const GS_SYSTEM_MODE_SET2: &[u8] = &[0xF0, 0x41, 0, 0x42, 0x12, 0x00, 0x00, 0x7F, 0x01, 0x00, 0xF7];
const XG_SYSTEM_ON: &[u8] = &[0xF0, 0x43, 0, 0x4C, 0x00, 0x00, 0x7E, 0x00, 0xF7];

/// Exact unsigned ratio, kept reduced. Tempo is the product of the
/// per-tick fraction and the microseconds-per-quarter value, so seconds per
/// tick stay exact across tempo changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FixedFraction {
    num: u64,
    den: u64,
}

impl Default for FixedFraction {
    fn default() -> FixedFraction {
        FixedFraction { num: 0, den: 1 }
    }
}

impl FixedFraction {
    pub fn whole(value: u64) -> FixedFraction {
        FixedFraction { num: value, den: 1 }
    }

    pub fn ratio(num: u64, den: u64) -> FixedFraction {
        let mut fraction = FixedFraction { num, den };
        fraction.reduce();
        fraction
    }

    pub fn value(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    fn reduce(&mut self) {
        if self.num == 0 {
            self.den = 1;
            return;
        }
        let mut a = self.num;
        let mut b = self.den;
        while b != 0 {
            let t = a % b;
            a = b;
            b = t;
        }
        self.num /= a;
        self.den /= a;
    }
}

impl std::ops::Mul for FixedFraction {
    type Output = FixedFraction;
    fn mul(self, other: FixedFraction) -> FixedFraction {
        let mut out = FixedFraction { num: self.num * other.num, den: self.den * other.den };
        out.reduce();
        out
    }
}

impl std::ops::Mul<u64> for FixedFraction {
    type Output = FixedFraction;
    fn mul(self, other: u64) -> FixedFraction {
        let mut out = FixedFraction { num: self.num * other, den: self.den };
        out.reduce();
        out
    }
}

fn read_int_big_endian(data: &[u8]) -> u64 {
    let mut result = 0u64;
    for &byte in data {
        result = (result << 8) + byte as u64;
    }
    result
}

/// Standard MIDI 7-bit variable-length quantity.
fn read_vlq(data: &[u8], pos: &mut usize) -> Option<u64> {
    let mut result = 0u64;
    loop {
        let byte = *data.get(*pos)?;
        *pos += 1;
        result = (result << 7) + (byte & 0x7F) as u64;
        if byte & 0x80 == 0 {
            break;
        }
    }
    Some(result)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventKind {
    Unknown,
    NoteOff,
    NoteOn,
    NoteTouch,
    ControlChange,
    PatchChange,
    ChannelTouch,
    PitchWheel,
    SysEx,
    SysComSongPosition,
    SysComSongSelect,
    Special,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MetaKind {
    None,
    EndTrack,
    TempoChange,
    Marker,
    DeviceSwitch,
    SongBeginHook,
    LoopStart,
    LoopEnd,
    LoopStackBegin,
    LoopStackEnd,
    LoopStackBreak,
    Other,
}

#[derive(Debug, Clone)]
pub(crate) struct SeqEvent {
    pub kind: EventKind,
    pub meta: MetaKind,
    pub channel: u8,
    pub data: Vec<u8>,
    /// Absolute tick position, used for the tempo calculation only.
    pub tick: u64,
}

impl SeqEvent {
    fn new(kind: EventKind) -> SeqEvent {
        SeqEvent { kind, meta: MetaKind::None, channel: 0, data: Vec::new(), tick: 0 }
    }

    fn special(meta: MetaKind) -> SeqEvent {
        SeqEvent { kind: EventKind::Special, meta, channel: 0, data: Vec::new(), tick: 0 }
    }
}

/// All events due at one tick position of one track.
#[derive(Debug, Clone, Default)]
pub(crate) struct TrackRow {
    /// Absolute time position in seconds.
    time: f64,
    /// Delay to the next row in ticks.
    delay: u64,
    /// Absolute position in ticks.
    tick: u64,
    /// Delay to the next row in seconds.
    time_delay: f64,
    events: Vec<SeqEvent>,
}

impl TrackRow {
    /// Stable category sort: SysEx, note-offs, loop/marker metas,
    /// controller-family events, then everything else, so controller state
    /// is current before notes trigger. Note-offs that land on the same row
    /// as their note-on are pushed behind it so zero-length notes do not
    /// hang.
    fn sort_events(&mut self, note_states: &mut [bool; NOTE_STATE_SLOTS]) {
        let mut sysex = Vec::new();
        let mut note_offs = Vec::new();
        let mut metas = Vec::new();
        let mut controllers = Vec::new();
        let mut any_other = Vec::new();

        for event in self.events.drain(..) {
            match event.kind {
                EventKind::NoteOff => note_offs.push(event),
                EventKind::SysEx => sysex.push(event),
                EventKind::ControlChange
                | EventKind::PatchChange
                | EventKind::PitchWheel
                | EventKind::ChannelTouch => controllers.push(event),
                EventKind::Special
                    if matches!(
                        event.meta,
                        MetaKind::Marker
                            | MetaKind::DeviceSwitch
                            | MetaKind::SongBeginHook
                            | MetaKind::LoopStart
                            | MetaKind::LoopEnd
                            | MetaKind::LoopStackBegin
                            | MetaKind::LoopStackEnd
                            | MetaKind::LoopStackBreak
                    ) =>
                {
                    metas.push(event)
                }
                _ => any_other.push(event),
            }
        }

        let mut mark_as_on = std::collections::BTreeSet::new();
        let mut i = 0;
        while i < any_other.len() {
            if any_other[i].kind == EventKind::NoteOn {
                let channel = any_other[i].channel;
                let key = any_other[i].data[0] & 0x7F;
                let note_i = channel as usize * 255 + key as usize;
                let was_on = note_states[note_i];
                mark_as_on.insert(note_i);
                // a second note-off for the same key on this row means a
                // zero-length note follows a held one
                let mut note_offs_on_same_note = 0;
                let mut j = 0;
                while j < note_offs.len() {
                    if note_offs[j].channel == channel && note_offs[j].data[0] == any_other[i].data[0] {
                        if !was_on || note_offs_on_same_note != 0 {
                            any_other.push(note_offs.remove(j));
                            mark_as_on.remove(&note_i);
                            continue;
                        } else {
                            note_offs_on_same_note += 1;
                        }
                    }
                    j += 1;
                }
            }
            i += 1;
        }

        for event in &note_offs {
            let note_i = event.channel as usize * 255 + (event.data[0] & 0x7F) as usize;
            note_states[note_i] = false;
        }
        for note_i in mark_as_on {
            note_states[note_i] = true;
        }

        self.events.extend(sysex);
        self.events.extend(note_offs);
        self.events.extend(metas);
        self.events.extend(controllers);
        self.events.extend(any_other);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TrackCursor {
    /// Delay to the next unhandled row in ticks.
    delay: u64,
    /// Negative once the end of the track has been reached.
    last_handled_event: i32,
    /// Row cursor into the pre-built track data.
    row: usize,
}

#[derive(Debug, Clone, Default)]
struct Position {
    /// Seconds until the next event batch is due.
    wait: f64,
    /// Absolute time position on the track in seconds.
    absolute_time_position: f64,
    track: Vec<TrackCursor>,
}

#[derive(Debug, Clone, Default)]
struct LoopStackEntry {
    infinity: bool,
    /// Loops left to run; negative means infinite.
    loops: i32,
    /// Position snapshot to jump back to.
    start_position: Position,
    start: u64,
    end: u64,
}

#[derive(Debug, Default)]
struct LoopState {
    caught_start: bool,
    caught_end: bool,
    caught_stack_start: bool,
    caught_stack_end: bool,
    caught_stack_break: bool,
    /// Skip the next stack-begin marker after a jump back onto it.
    skip_stack_start: bool,
    /// Loop points are unusable (start at or after end, or repeated).
    invalid_loop: bool,
    temporary_broken: bool,
    loops_count: i32,
    loops_left: i32,
    stack: Vec<LoopStackEntry>,
    stack_level: i32,
}

impl LoopState {
    fn reset(&mut self) {
        self.caught_start = false;
        self.caught_end = false;
        self.caught_stack_start = false;
        self.caught_stack_end = false;
        self.caught_stack_break = false;
        self.skip_stack_start = false;
        self.loops_left = self.loops_count;
    }

    fn full_reset(&mut self) {
        self.loops_count = -1;
        self.reset();
        self.invalid_loop = false;
        self.temporary_broken = false;
        self.stack.clear();
        self.stack_level = -1;
    }

    fn is_stack_end(&self) -> bool {
        if self.caught_stack_end && self.stack_level >= 0 && (self.stack_level as usize) < self.stack.len() {
            let entry = &self.stack[self.stack_level as usize];
            return entry.infinity || entry.loops > 0;
        }
        false
    }

    fn stack_up(&mut self) {
        self.stack_level += 1;
    }

    fn stack_down(&mut self) {
        self.stack_level -= 1;
    }

    fn current_stack_mut(&mut self) -> &mut LoopStackEntry {
        if self.stack_level >= 0 && (self.stack_level as usize) < self.stack.len() {
            let level = self.stack_level as usize;
            return &mut self.stack[level];
        }
        if self.stack.is_empty() {
            self.stack.push(LoopStackEntry::default());
        }
        &mut self.stack[0]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Midi,
    Rsxx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopFormat {
    Default,
    Emidi,
    Hmi,
}

#[derive(Debug, Clone)]
struct SequencerTime {
    /// Seconds of audio owed before the next tick.
    time_rest: f64,
    sample_rate: u32,
    frame_size: u32,
    /// Minimum possible delay, the tick granularity.
    minimum_delay: f64,
    /// Last delay returned by tick().
    delay: f64,
}

impl SequencerTime {
    fn new(sample_rate: u32, frame_size: u32) -> SequencerTime {
        let mut time = SequencerTime {
            time_rest: 0.0,
            sample_rate,
            frame_size,
            minimum_delay: 0.0,
            delay: 0.0,
        };
        time.reset();
        time
    }

    fn reset(&mut self) {
        self.time_rest = 0.0;
        self.minimum_delay = 1.0 / self.sample_rate as f64;
        self.delay = 0.0;
    }
}

/// Score parser and playback driver: builds a pre-timed row timeline from
/// SMF/RMI/GMF/MUS/RSXX input and dispatches due events to the engine as
/// wall-clock time advances.
pub struct Sequencer {
    format: FileFormat,
    loop_format: LoopFormat,

    current_position: Position,
    track_begin_position: Position,
    loop_begin_position: Position,

    loop_enabled: bool,
    full_song_time_length: f64,
    /// Delay after the song has played before the stream requests stop.
    post_song_wait_delay: f64,
    loop_start_time: f64,
    loop_end_time: f64,

    track_data: Vec<Vec<TrackRow>>,

    /// Seconds per tick at 1 microsecond per quarter.
    individual_tick_delta: FixedFraction,
    tempo: FixedFraction,
    tempo_multiplier: f64,
    at_end: bool,
    loop_count: i32,

    loop_state: LoopState,
    channel_disabled: [bool; NUM_CHANNELS],
    time: SequencerTime,
    have_song: bool,
}

impl Sequencer {
    pub fn new(sample_rate: u32, frame_size: u32) -> Sequencer {
        let mut sequencer = Sequencer {
            format: FileFormat::Midi,
            loop_format: LoopFormat::Default,
            current_position: Position::default(),
            track_begin_position: Position::default(),
            loop_begin_position: Position::default(),
            loop_enabled: false,
            full_song_time_length: 0.0,
            post_song_wait_delay: 1.0,
            loop_start_time: -1.0,
            loop_end_time: -1.0,
            track_data: Vec::new(),
            individual_tick_delta: FixedFraction::default(),
            tempo: FixedFraction::default(),
            tempo_multiplier: 1.0,
            at_end: false,
            loop_count: -1,
            loop_state: LoopState::default(),
            channel_disabled: [false; NUM_CHANNELS],
            time: SequencerTime::new(sample_rate, frame_size),
            have_song: false,
        };
        sequencer.loop_state.reset();
        sequencer.loop_state.invalid_loop = false;
        sequencer
    }

    pub fn position_at_end(&self) -> bool {
        self.at_end
    }

    pub fn has_song(&self) -> bool {
        self.have_song
    }

    pub fn set_loop_enabled(&mut self, enabled: bool) {
        self.loop_enabled = enabled;
    }

    pub fn set_loop_count(&mut self, count: i32) {
        self.loop_count = count;
        self.loop_state.loops_count = count;
        self.loop_state.loops_left = count;
    }

    pub fn set_tempo_multiplier(&mut self, multiplier: f64) {
        if multiplier > 0.0 {
            self.tempo_multiplier = multiplier;
        }
    }

    pub fn set_channel_enabled(&mut self, channel: usize, enabled: bool) {
        if channel < NUM_CHANNELS {
            self.channel_disabled[channel] = !enabled;
        }
    }

    /// Timeline length plus the post-song delay.
    pub fn song_length_seconds(&self) -> f64 {
        self.full_song_time_length
    }

    pub fn position_seconds(&self) -> f64 {
        self.current_position.absolute_time_position
    }

    pub fn loop_points_seconds(&self) -> Option<(f64, f64)> {
        if self.loop_state.invalid_loop || self.loop_start_time < 0.0 || self.loop_end_time < 0.0 {
            None
        } else {
            Some((self.loop_start_time, self.loop_end_time))
        }
    }

    pub fn load_song(&mut self, data: &[u8]) -> Result<(), SynthError> {
        self.have_song = false;
        self.at_end = false;
        self.loop_state.full_reset();
        self.loop_state.caught_start = true;
        self.format = FileFormat::Midi;

        if data.len() < MIDI_PARSE_HEADER_SIZE {
            return Err(SynthError::Truncated("song header"));
        }

        if &data[..8] == SMF_MAGIC {
            self.parse_smf(data)?;
        } else if &data[..4] == b"RIFF" {
            self.parse_rmi(data)?;
        } else if &data[..4] == b"GMF\x01" {
            self.parse_gmf(data)?;
        } else if Sequencer::detect_rsxx(data) {
            self.parse_rsxx(data)?;
        } else if &data[..4] == b"MUS\x1A" {
            let converted = mus::mus_to_midi(data)?;
            self.parse_smf(&converted)?;
        } else {
            return Err(SynthError::UnknownSongFormat);
        }

        self.have_song = true;
        Ok(())
    }

    pub fn full_reset(&mut self) {
        self.at_end = false;
        self.loop_state.full_reset();
        self.loop_state.caught_start = true;
        self.format = FileFormat::Midi;
    }

    pub fn rewind(&mut self) {
        self.current_position = self.track_begin_position.clone();
        self.at_end = false;

        self.loop_state.loops_count = self.loop_count;
        self.loop_state.reset();
        self.loop_state.caught_start = true;
        self.loop_state.temporary_broken = false;
        self.time.reset();
    }

    /// Pull `stream.len()` bytes of interleaved stereo f32 frames, advancing
    /// the event queue as wall-clock time passes. Returns the bytes written.
    pub(crate) fn play_stream(&mut self, engine: &mut Engine, stream: &mut [u8]) -> usize {
        let frame_size = self.time.frame_size as usize;
        let samples = stream.len() / frame_size;

        if !self.have_song {
            // no score loaded: the host still gets its silence
            for byte in stream[..samples * frame_size].iter_mut() {
                *byte = 0;
            }
            return samples * frame_size;
        }

        let mut count = 0usize;
        let mut left = samples;
        let mut byte_pos = 0usize;

        while left > 0 {
            let left_delay = left as f64 / self.time.sample_rate as f64;
            let max_delay = if self.time.time_rest < left_delay { self.time.time_rest } else { left_delay };
            if self.position_at_end() && self.time.delay <= 0.0 {
                // song end reached with looping disabled
                break;
            }

            self.time.time_rest -= max_delay;
            let period_size = (self.time.sample_rate as f64 * max_delay) as usize;
            let generate_size = period_size.min(left);

            for _ in 0..generate_size {
                let (l, r) = engine.render_frame();
                stream[byte_pos..byte_pos + 4].copy_from_slice(&l.to_le_bytes());
                stream[byte_pos + 4..byte_pos + 8].copy_from_slice(&r.to_le_bytes());
                byte_pos += frame_size;
            }
            count += generate_size;
            left -= generate_size;

            if self.time.time_rest <= 0.0 {
                self.time.delay = self.tick(self.time.delay, self.time.minimum_delay, engine);
                self.time.time_rest += self.time.delay;
            }
        }

        count * frame_size
    }

    /// Advance the event queue by `s` seconds of wall time. Returns the
    /// delay until the next event batch.
    pub(crate) fn tick(&mut self, s: f64, granularity: f64, engine: &mut Engine) -> f64 {
        let s = s * self.tempo_multiplier;
        self.current_position.wait -= s;
        self.current_position.absolute_time_position += s;

        // bail out of malformed zero-delay event storms
        let mut anti_freeze_counter = 10000;
        while self.current_position.wait <= granularity * 0.5 && anti_freeze_counter > 0 {
            if !self.process_events(engine) {
                break;
            }
            if self.current_position.wait <= 0.0 {
                anti_freeze_counter -= 1;
            }
        }

        if anti_freeze_counter <= 0 {
            warn!("anti-freeze guard tripped, injecting a one second delay");
            self.current_position.wait += 1.0;
        }

        if self.current_position.wait < 0.0 {
            return 0.0;
        }
        self.current_position.wait
    }

    fn detect_rsxx(data: &[u8]) -> bool {
        let start = data[0] as usize;
        if data[0] < 0x5D || start < 0x10 {
            return false;
        }
        let magic_at = start - 0x10;
        data.len() >= magic_at + 6 && &data[magic_at..magic_at + 6] == b"rsxx}u"
    }

    fn parse_rsxx(&mut self, data: &[u8]) -> Result<(), SynthError> {
        let start = data[0] as usize;
        if !Sequencer::detect_rsxx(data) || start >= data.len() {
            return Err(SynthError::MalformedSong("bad RSXX header"));
        }
        self.format = FileFormat::Rsxx;

        let delta_ticks = 60u64;
        self.individual_tick_delta = FixedFraction::ratio(1, 1_000_000 * delta_ticks);
        self.tempo = FixedFraction::ratio(1, delta_ticks);

        let mut track = data[start..].to_vec();
        track.push(0);
        self.build_smf_track_data(&[track])?;
        self.loop_state.stack_level = -1;
        Ok(())
    }

    fn parse_gmf(&mut self, data: &[u8]) -> Result<(), SynthError> {
        if &data[..4] != b"GMF\x01" || data.len() <= 7 {
            return Err(SynthError::MalformedSong("bad GMF header"));
        }

        let delta_ticks = 192u64;
        self.individual_tick_delta = FixedFraction::ratio(1, 1_000_000 * delta_ticks);
        self.tempo = FixedFraction::ratio(1, delta_ticks * 2);

        // GMF carries no end tag of its own
        let mut track = data[7..].to_vec();
        track.extend_from_slice(&[0xFF, 0x2F, 0x00, 0x00]);
        self.build_smf_track_data(&[track])
    }

    fn parse_rmi(&mut self, data: &[u8]) -> Result<(), SynthError> {
        if &data[..4] != b"RIFF" || data.len() < MIDI_PARSE_HEADER_SIZE + 6 {
            return Err(SynthError::MalformedSong("bad RMI header"));
        }
        self.format = FileFormat::Midi;
        // the embedded SMF sits behind the 20-byte RIFF preamble
        self.parse_smf(&data[20..])
    }

    fn parse_smf(&mut self, data: &[u8]) -> Result<(), SynthError> {
        if data.len() < MIDI_PARSE_HEADER_SIZE || &data[..8] != SMF_MAGIC {
            return Err(SynthError::MalformedSong("bad SMF header"));
        }

        let track_count = read_int_big_endian(&data[10..12]) as usize;
        let delta_ticks = read_int_big_endian(&data[12..14]).max(1);

        self.individual_tick_delta = FixedFraction::ratio(1, 1_000_000 * delta_ticks);
        self.tempo = FixedFraction::ratio(1, delta_ticks * 2);

        let mut raw_track_data = Vec::with_capacity(track_count);
        let mut pos = MIDI_PARSE_HEADER_SIZE;
        for _ in 0..track_count {
            if pos + 8 > data.len() || &data[pos..pos + 4] != TRACK_MAGIC {
                return Err(SynthError::MalformedSong("bad track header"));
            }
            let track_length = read_int_big_endian(&data[pos + 4..pos + 8]) as usize;
            pos += 8;
            if pos + track_length > data.len() {
                return Err(SynthError::MalformedSong("truncated track data"));
            }
            raw_track_data.push(data[pos..pos + track_length].to_vec());
            pos += track_length;
        }

        if raw_track_data.iter().map(|track| track.len()).sum::<usize>() == 0 {
            return Err(SynthError::MalformedSong("empty track data"));
        }

        self.build_smf_track_data(&raw_track_data)?;
        self.loop_state.stack_level = -1;
        Ok(())
    }

    fn build_setup_reset(&mut self, track_count: usize) {
        self.full_song_time_length = 0.0;
        self.loop_start_time = -1.0;
        self.loop_end_time = -1.0;
        self.loop_format = LoopFormat::Default;
        self.channel_disabled = [false; NUM_CHANNELS];
        self.track_data.clear();
        self.track_data.resize(track_count, Vec::new());

        self.loop_state.reset();
        self.loop_state.invalid_loop = false;
        self.time.reset();

        self.current_position = Position {
            wait: 0.0,
            absolute_time_position: 0.0,
            track: vec![TrackCursor::default(); track_count],
        };
    }

    fn build_smf_track_data(&mut self, raw_track_data: &[Vec<u8>]) -> Result<(), SynthError> {
        let track_count = raw_track_data.len();
        self.build_setup_reset(track_count);

        let mut got_global_loop_start = false;
        let mut got_global_loop_end = false;
        let mut got_stack_loop_start = false;
        let mut got_loop_event_in_this_row = false;

        let mut loop_start_ticks = 0u64;
        let mut loop_end_ticks = 0u64;
        let mut ticks_song_length = 0u64;

        let mut tempos_list: Vec<SeqEvent> = Vec::new();

        for tk in 0..track_count {
            let data = &raw_track_data[tk];
            let mut pos = 0usize;
            let mut status: i32 = 0;
            let mut abs_position = 0u64;
            // cached note on/off states, required to catch zero-length notes
            // during the row sort
            let mut note_states = [false; NOTE_STATE_SLOTS];

            // time delay that follows the first event in the track
            {
                let mut first_row = TrackRow::default();
                if self.format != FileFormat::Rsxx {
                    first_row.delay = read_vlq(data, &mut pos)
                        .ok_or(SynthError::MalformedSong("missing initial delta time"))?;
                }

                if tk == 0 {
                    // every song begins with a hook row so state carried from
                    // a previous song cannot leak in
                    first_row.events.push(SeqEvent::special(MetaKind::SongBeginHook));
                }

                first_row.tick = abs_position;
                abs_position += first_row.delay;
                self.track_data[tk].push(first_row);
            }

            let mut row = TrackRow::default();
            loop {
                let event = self.parse_event(data, &mut pos, &mut status)?;
                let mut reached_end = event.meta == MetaKind::EndTrack;

                row.events.push(event.clone());
                if event.kind == EventKind::Special {
                    match event.meta {
                        MetaKind::TempoChange => {
                            let mut tempo_event = event.clone();
                            tempo_event.tick = abs_position;
                            tempos_list.push(tempo_event);
                        }
                        MetaKind::LoopStart if !self.loop_state.invalid_loop => {
                            // loopStart is invalid when it starts together
                            // with loopEnd or appears twice
                            if got_global_loop_start || got_loop_event_in_this_row {
                                self.loop_state.invalid_loop = true;
                            } else {
                                got_global_loop_start = true;
                                loop_start_ticks = abs_position;
                            }
                            got_loop_event_in_this_row = true;
                        }
                        MetaKind::LoopEnd if !self.loop_state.invalid_loop => {
                            if got_global_loop_end || got_loop_event_in_this_row {
                                self.loop_state.invalid_loop = true;
                            } else {
                                got_global_loop_end = true;
                                loop_end_ticks = abs_position;
                            }
                            got_loop_event_in_this_row = true;
                        }
                        MetaKind::LoopStackBegin if !self.loop_state.invalid_loop => {
                            if !got_stack_loop_start {
                                if !got_global_loop_start {
                                    loop_start_ticks = abs_position;
                                }
                                got_stack_loop_start = true;
                            }
                            self.loop_state.stack_up();
                            if self.loop_state.stack_level >= self.loop_state.stack.len() as i32 {
                                let loops = *event.data.first().unwrap_or(&0) as i32;
                                self.loop_state.stack.push(LoopStackEntry {
                                    infinity: loops == 0,
                                    loops,
                                    start_position: Position::default(),
                                    start: abs_position,
                                    end: abs_position,
                                });
                            }
                        }
                        MetaKind::LoopStackEnd | MetaKind::LoopStackBreak
                            if !self.loop_state.invalid_loop =>
                        {
                            if self.loop_state.stack_level <= -1 {
                                // loop end without a loop start
                                self.loop_state.invalid_loop = true;
                            } else {
                                if loop_end_ticks < abs_position {
                                    loop_end_ticks = abs_position;
                                }
                                self.loop_state.current_stack_mut().end = abs_position;
                                self.loop_state.stack_down();
                            }
                        }
                        _ => {}
                    }
                }

                if !reached_end {
                    match read_vlq(data, &mut pos) {
                        Some(delay) => row.delay = delay,
                        None => {
                            // end of track reached without an EOT event
                            reached_end = true;
                        }
                    }
                }

                if row.delay > 0 || reached_end {
                    row.tick = abs_position;
                    abs_position += row.delay;
                    row.sort_events(&mut note_states);
                    self.track_data[tk].push(std::mem::take(&mut row));
                    got_loop_event_in_this_row = false;
                }

                if reached_end || pos > data.len() {
                    break;
                }
            }

            if ticks_song_length < abs_position {
                ticks_song_length = abs_position;
            }
        }

        if got_global_loop_start && !got_global_loop_end {
            loop_end_ticks = ticks_song_length;
        }

        // loopStart must be located before loopEnd
        if loop_start_ticks >= loop_end_ticks {
            self.loop_state.invalid_loop = true;
        }

        self.build_timeline(&tempos_list, loop_start_ticks, loop_end_ticks);
        Ok(())
    }

    fn build_timeline(&mut self, tempos: &[SeqEvent], loop_start_ticks: u64, loop_end_ticks: u64) {
        struct TempoChangePoint {
            tick: u64,
            tempo: FixedFraction,
        }

        let track_count = self.track_data.len();
        let base_tempo = self.tempo;
        let tick_delta = self.individual_tick_delta;
        let invalid_loop = self.loop_state.invalid_loop;

        for tk in 0..track_count {
            let mut current_tempo = base_tempo;
            let mut time = 0.0f64;
            let mut tempo_change_index = 0usize;
            if self.track_data[tk].is_empty() {
                continue;
            }

            let mut prev_i = 0usize;
            for i in 0..self.track_data[tk].len() {
                // split tempo changes falling inside the previous row's span
                if i != prev_i && !tempos.is_empty() && tempo_change_index < tempos.len() {
                    let row_tick = self.track_data[tk][i].tick;
                    if tempos[tempo_change_index].tick <= row_tick {
                        let mut points = vec![TempoChangePoint {
                            tick: self.track_data[tk][prev_i].tick,
                            tempo: current_tempo,
                        }];
                        loop {
                            let tempo_point = &tempos[tempo_change_index];
                            points.push(TempoChangePoint {
                                tick: tempo_point.tick,
                                tempo: tick_delta * FixedFraction::whole(read_int_big_endian(&tempo_point.data)),
                            });
                            tempo_change_index += 1;
                            if !(tempo_change_index < tempos.len() && tempos[tempo_change_index].tick <= row_tick) {
                                break;
                            }
                        }

                        time -= self.track_data[tk][prev_i].time_delay;
                        self.track_data[tk][prev_i].time_delay = 0.0;

                        for pair in points.windows(2) {
                            let mid_delay = pair[1].tick - pair[0].tick;
                            let t = current_tempo * mid_delay;
                            self.track_data[tk][prev_i].time_delay += t.value();
                            current_tempo = pair[1].tempo;
                        }
                        let tail_tick = points.last().map(|p| p.tick).unwrap_or(0);
                        let post_delay = row_tick - tail_tick;
                        let t = current_tempo * post_delay;
                        self.track_data[tk][prev_i].time_delay += t.value();

                        self.track_data[tk][prev_i].time = time;
                        time += self.track_data[tk][prev_i].time_delay;
                    }
                }

                let t = current_tempo * self.track_data[tk][i].delay;
                self.track_data[tk][i].time_delay = t.value();
                self.track_data[tk][i].time = time;
                time += self.track_data[tk][i].time_delay;

                if !invalid_loop {
                    if loop_start_ticks == self.track_data[tk][i].tick {
                        self.loop_start_time = self.track_data[tk][i].time;
                    } else if loop_end_ticks == self.track_data[tk][i].tick {
                        self.loop_end_time = self.track_data[tk][i].time;
                    }
                }
                prev_i = i;
            }

            if time > self.full_song_time_length {
                self.full_song_time_length = time;
            }
        }

        self.full_song_time_length += self.post_song_wait_delay;
        self.track_begin_position = self.current_position.clone();
        // the loop begins at the start of the track until the loop point has
        // been passed
        self.loop_begin_position = self.current_position.clone();
        self.loop_state.stack_level = -1;

        self.loop_state.loops_count = self.loop_count;
        self.loop_state.loops_left = self.loop_count;

        // scan forward for the first loop-start row and remember it
        if !self.loop_state.invalid_loop && !self.current_position.track.is_empty() {
            let mut caught_loop_starts = 0u32;
            let mut scan_done = false;
            let ctrack_count = self.current_position.track.len();
            let mut row_position = self.current_position.clone();

            while !scan_done {
                let row_begin_position = row_position.clone();

                for tk in 0..ctrack_count {
                    let cursor = &mut row_position.track[tk];
                    if cursor.last_handled_event >= 0 && cursor.delay == 0 {
                        if cursor.row >= self.track_data[tk].len() {
                            cursor.last_handled_event = -1;
                            continue;
                        }

                        for event in &self.track_data[tk][cursor.row].events {
                            if event.kind == EventKind::Special && event.meta == MetaKind::LoopStart {
                                caught_loop_starts += 1;
                                scan_done = true;
                                break;
                            }
                        }

                        if cursor.last_handled_event >= 0 {
                            cursor.delay += self.track_data[tk][cursor.row].delay;
                            cursor.row += 1;
                        }
                    }
                }

                let mut shortest_delay = 0u64;
                let mut shortest_delay_not_found = true;
                for cursor in &row_position.track {
                    if cursor.last_handled_event >= 0 && (shortest_delay_not_found || cursor.delay < shortest_delay) {
                        shortest_delay = cursor.delay;
                        shortest_delay_not_found = false;
                    }
                }
                for cursor in &mut row_position.track {
                    cursor.delay = cursor.delay.saturating_sub(shortest_delay);
                }

                if caught_loop_starts > 0 {
                    self.loop_begin_position = row_begin_position;
                    self.loop_begin_position.absolute_time_position = self.loop_start_time;
                    scan_done = true;
                }

                if shortest_delay_not_found {
                    break;
                }
            }
        }
    }

    fn parse_event(&mut self, data: &[u8], pos: &mut usize, status: &mut i32) -> Result<SeqEvent, SynthError> {
        if *pos >= data.len() {
            // a track that does not end in the middle of event data is fine
            return Ok(SeqEvent::special(MetaKind::EndTrack));
        }

        let mut byte = data[*pos];
        *pos += 1;

        if byte == 0xF0 || byte == 0xF7 {
            // SysEx
            let length = read_vlq(data, pos).ok_or(SynthError::MalformedSong("bad SysEx length"))? as usize;
            if *pos + length > data.len() {
                return Err(SynthError::MalformedSong("truncated SysEx"));
            }
            let mut event = SeqEvent::new(EventKind::SysEx);
            event.data.push(byte);
            event.data.extend_from_slice(&data[*pos..*pos + length]);
            *pos += length;
            return Ok(event);
        }

        if byte == 0xFF {
            // meta event
            if *pos >= data.len() {
                return Err(SynthError::MalformedSong("truncated meta event"));
            }
            let sub_type = data[*pos];
            *pos += 1;
            let length = read_vlq(data, pos).ok_or(SynthError::MalformedSong("bad meta length"))? as usize;
            if *pos + length > data.len() {
                return Err(SynthError::MalformedSong("truncated meta event"));
            }
            let payload = &data[*pos..*pos + length];
            *pos += length;

            let mut event = SeqEvent::new(EventKind::Special);
            event.meta = match sub_type {
                0x2F => MetaKind::EndTrack,
                0x51 => MetaKind::TempoChange,
                0x06 => MetaKind::Marker,
                0x09 => MetaKind::DeviceSwitch,
                _ => MetaKind::Other,
            };
            event.data.extend_from_slice(payload);

            if event.meta == MetaKind::Marker {
                let text = String::from_utf8_lossy(payload).to_lowercase();
                if text == "loopstart" {
                    event.meta = MetaKind::LoopStart;
                    event.data.clear();
                    return Ok(event);
                }
                if text == "loopend" {
                    event.meta = MetaKind::LoopEnd;
                    event.data.clear();
                    return Ok(event);
                }
                if let Some(count) = text.strip_prefix("loopstart=") {
                    event.meta = MetaKind::LoopStackBegin;
                    event.data.clear();
                    event.data.push(count.trim().parse::<u8>().unwrap_or(0));
                    return Ok(event);
                }
                if text.starts_with("loopend=") {
                    event.meta = MetaKind::LoopStackEnd;
                    event.data.clear();
                    return Ok(event);
                }
            }

            if event.meta == MetaKind::EndTrack {
                *status = -1;
            }
            return Ok(event);
        }

        // running status: any data byte re-uses the previous event head
        if byte < 0x80 {
            byte = (*status as u8) | 0x80;
            *pos -= 1;
        }

        if byte == 0xF3 {
            // Sys Com Song Select
            if *pos + 1 > data.len() {
                return Err(SynthError::MalformedSong("truncated song select"));
            }
            let mut event = SeqEvent::new(EventKind::SysComSongSelect);
            event.data.push(data[*pos]);
            *pos += 1;
            return Ok(event);
        }

        if byte == 0xF2 {
            // Sys Com Song Position Pointer
            if *pos + 2 > data.len() {
                return Err(SynthError::MalformedSong("truncated song position"));
            }
            let mut event = SeqEvent::new(EventKind::SysComSongPosition);
            event.data.extend_from_slice(&data[*pos..*pos + 2]);
            *pos += 2;
            return Ok(event);
        }

        let mid_ch = byte & 0x0F;
        let ev_type = (byte >> 4) & 0x0F;
        *status = byte as i32;

        let mut event = SeqEvent::new(match ev_type {
            0x8 => EventKind::NoteOff,
            0x9 => EventKind::NoteOn,
            0xA => EventKind::NoteTouch,
            0xB => EventKind::ControlChange,
            0xC => EventKind::PatchChange,
            0xD => EventKind::ChannelTouch,
            0xE => EventKind::PitchWheel,
            _ => EventKind::Unknown,
        });
        event.channel = mid_ch;

        match event.kind {
            EventKind::NoteOff
            | EventKind::NoteOn
            | EventKind::NoteTouch
            | EventKind::ControlChange
            | EventKind::PitchWheel => {
                if *pos + 2 > data.len() {
                    return Err(SynthError::MalformedSong("truncated channel event"));
                }
                event.data.extend_from_slice(&data[*pos..*pos + 2]);
                *pos += 2;

                if event.kind == EventKind::NoteOn && event.data[1] == 0 {
                    // note-on with zero velocity is a note-off
                    event.kind = EventKind::NoteOff;
                } else if event.kind == EventKind::ControlChange && self.format == FileFormat::Midi {
                    // HMI/EMIDI loop controllers (RPG Maker and friends)
                    match event.data[0] {
                        110 => {
                            if self.loop_format == LoopFormat::Default {
                                event.kind = EventKind::Special;
                                event.meta = MetaKind::LoopStart;
                                event.data.clear();
                                self.loop_format = LoopFormat::Hmi;
                            } else if self.loop_format == LoopFormat::Hmi {
                                // a repeated CC110 means EMIDI-style track
                                // repetition instead
                                self.loop_format = LoopFormat::Emidi;
                            }
                        }
                        111 => {
                            if self.loop_format == LoopFormat::Hmi {
                                event.kind = EventKind::Special;
                                event.meta = MetaKind::LoopEnd;
                                event.data.clear();
                            } else if self.loop_format != LoopFormat::Emidi {
                                event.kind = EventKind::Special;
                                event.meta = MetaKind::LoopStart;
                                event.data.clear();
                            }
                        }
                        113 => {
                            if self.loop_format == LoopFormat::Emidi {
                                // EMIDI uses CC113 with the same meaning as
                                // CC7
                                event.data[0] = 7;
                            }
                        }
                        _ => {}
                    }
                }
            }
            EventKind::PatchChange | EventKind::ChannelTouch => {
                if *pos + 1 > data.len() {
                    return Err(SynthError::MalformedSong("truncated channel event"));
                }
                event.data.push(data[*pos]);
                *pos += 1;
            }
            _ => {}
        }

        Ok(event)
    }

    /// Run all due rows once, advance cursors, and resolve loop state.
    /// Returns false when there are no more events in the queue.
    fn process_events(&mut self, engine: &mut Engine) -> bool {
        if self.current_position.track.is_empty() {
            self.at_end = true;
        }
        if self.at_end {
            return false;
        }

        self.loop_state.caught_end = false;
        let track_count = self.current_position.track.len();
        let row_begin_position = self.current_position.clone();
        let mut do_loop_jump = false;
        let mut caught_loop_starts = 0u32;
        let mut caught_loop_stack_starts = 0u32;
        let mut caught_loop_stack_ends = 0u32;
        let mut caught_loop_stack_breaks = 0u32;

        {
            let Sequencer {
                track_data,
                current_position,
                loop_state,
                tempo,
                individual_tick_delta,
                channel_disabled,
                loop_enabled,
                ..
            } = self;

            for tk in 0..track_count {
                let cursor = &mut current_position.track[tk];
                if cursor.last_handled_event >= 0 && cursor.delay == 0 {
                    if cursor.row >= track_data[tk].len() {
                        cursor.last_handled_event = -1;
                        break;
                    }

                    for event in &track_data[tk][cursor.row].events {
                        handle_event(
                            event,
                            &mut cursor.last_handled_event,
                            engine,
                            tempo,
                            *individual_tick_delta,
                            *loop_enabled,
                            loop_state,
                            channel_disabled,
                        );

                        if loop_state.caught_start {
                            caught_loop_starts += 1;
                            loop_state.caught_start = false;
                        }
                        if loop_state.caught_stack_start {
                            caught_loop_stack_starts += 1;
                            loop_state.caught_stack_start = false;
                        }
                        if loop_state.caught_stack_break {
                            caught_loop_stack_breaks += 1;
                            loop_state.caught_stack_break = false;
                        }
                        if loop_state.caught_end || loop_state.is_stack_end() {
                            if loop_state.caught_stack_end {
                                loop_state.caught_stack_end = false;
                                caught_loop_stack_ends += 1;
                            }
                            // stop event handling on catching the loop end
                            do_loop_jump = true;
                            break;
                        }
                    }

                    if cursor.last_handled_event >= 0 {
                        cursor.delay += track_data[tk][cursor.row].delay;
                        cursor.row += 1;
                    }

                    if do_loop_jump {
                        break;
                    }
                }
            }
        }

        // schedule the next event batch after the shortest delay of all
        // tracks
        let mut shortest_delay = 0u64;
        let mut shortest_delay_not_found = true;
        for cursor in &self.current_position.track {
            if cursor.last_handled_event >= 0 && (shortest_delay_not_found || cursor.delay < shortest_delay) {
                shortest_delay = cursor.delay;
                shortest_delay_not_found = false;
            }
        }
        for cursor in &mut self.current_position.track {
            cursor.delay = cursor.delay.saturating_sub(shortest_delay);
        }

        let t = self.tempo * shortest_delay;
        self.current_position.wait += t.value();

        if caught_loop_starts > 0 && self.loop_begin_position.absolute_time_position <= 0.0 {
            self.loop_begin_position = row_begin_position.clone();
        }

        if caught_loop_stack_starts > 0 {
            while caught_loop_stack_starts > 0 {
                self.loop_state.stack_up();
                let entry = self.loop_state.current_stack_mut();
                entry.start_position = row_begin_position.clone();
                caught_loop_stack_starts -= 1;
            }
            return true;
        }

        while caught_loop_stack_breaks > 0 {
            let entry = self.loop_state.current_stack_mut();
            entry.loops = 0;
            entry.infinity = false;
            self.loop_state.stack_down();
            caught_loop_stack_breaks -= 1;
        }

        if caught_loop_stack_ends > 0 {
            while caught_loop_stack_ends > 0 {
                let entry = self.loop_state.current_stack_mut();
                if entry.infinity {
                    self.current_position = entry.start_position.clone();
                    self.loop_state.skip_stack_start = true;
                    engine.all_channels_control_change(123, 0);
                    return true;
                } else if entry.loops >= 0 {
                    entry.loops -= 1;
                    if entry.loops > 0 {
                        self.current_position = entry.start_position.clone();
                        self.loop_state.skip_stack_start = true;
                        engine.all_channels_control_change(123, 0);
                        return true;
                    } else {
                        self.loop_state.stack_down();
                    }
                } else {
                    self.loop_state.stack_down();
                }
                caught_loop_stack_ends -= 1;
            }
            return true;
        }

        if shortest_delay_not_found || self.loop_state.caught_end {
            // song end or loop end point has been reached
            engine.all_channels_control_change(123, 0);
            self.loop_state.caught_end = false;

            if !self.loop_enabled
                || (shortest_delay_not_found && self.loop_state.loops_count >= 0 && self.loop_state.loops_left < 1)
            {
                self.at_end = true;
                // one extra second before the stream stops
                self.current_position.wait += self.post_song_wait_delay;
                return true;
            }

            if self.loop_state.temporary_broken {
                self.current_position = self.track_begin_position.clone();
                self.loop_state.temporary_broken = false;
            } else if self.loop_state.loops_count < 0 || self.loop_state.loops_left >= 1 {
                self.current_position = self.loop_begin_position.clone();
                if self.loop_state.loops_count >= 1 {
                    self.loop_state.loops_left -= 1;
                }
            }
        }

        true
    }
}

fn match_sysex(data: &[u8], sysex: &[u8]) -> bool {
    if data.len() != sysex.len() {
        return false;
    }
    for (i, (&got, &expected)) in data.iter().zip(sysex.iter()).enumerate() {
        // byte 2 is the device ID; respond to all of them
        if i != 2 && got != expected {
            return false;
        }
    }
    true
}

#[allow(clippy::too_many_arguments)]
fn handle_event(
    event: &SeqEvent,
    status: &mut i32,
    engine: &mut Engine,
    tempo: &mut FixedFraction,
    tick_delta: FixedFraction,
    loop_enabled: bool,
    loop_state: &mut LoopState,
    channel_disabled: &[bool; NUM_CHANNELS],
) {
    if event.kind == EventKind::SysEx {
        if match_sysex(&event.data, GM_SYSTEM_ON) || match_sysex(&event.data, GM_SYSTEM_OFF) {
            engine.set_standard(Standard::Gm);
        } else if match_sysex(&event.data, GS_RESET)
            || match_sysex(&event.data, GS_SYSTEM_MODE_SET1)
            || match_sysex(&event.data, GS_SYSTEM_MODE_SET2)
        {
            engine.set_standard(Standard::Gs);
        } else if match_sysex(&event.data, XG_SYSTEM_ON) {
            engine.set_standard(Standard::Xg);
        }
        return;
    }

    if event.kind == EventKind::Special {
        match event.meta {
            MetaKind::EndTrack => {
                *status = -1;
            }
            MetaKind::TempoChange => {
                *tempo = tick_delta * FixedFraction::whole(read_int_big_endian(&event.data));
            }
            MetaKind::LoopStart if loop_enabled && !loop_state.invalid_loop => {
                loop_state.caught_start = true;
            }
            MetaKind::LoopEnd if loop_enabled && !loop_state.invalid_loop => {
                loop_state.caught_end = true;
            }
            MetaKind::LoopStackBegin if loop_enabled && !loop_state.invalid_loop => {
                if loop_state.skip_stack_start {
                    loop_state.skip_stack_start = false;
                    return;
                }

                let loops = *event.data.first().unwrap_or(&0) as i32;
                let slevel = (loop_state.stack_level + 1) as usize;
                while slevel >= loop_state.stack.len() {
                    loop_state.stack.push(LoopStackEntry {
                        infinity: loops == 0,
                        loops,
                        start_position: Position::default(),
                        start: 0,
                        end: 0,
                    });
                }
                let entry = &mut loop_state.stack[slevel];
                entry.loops = loops;
                entry.infinity = loops == 0;
                loop_state.caught_stack_start = true;
            }
            MetaKind::LoopStackEnd if loop_enabled && !loop_state.invalid_loop => {
                loop_state.caught_stack_end = true;
            }
            MetaKind::LoopStackBreak if loop_enabled && !loop_state.invalid_loop => {
                loop_state.caught_stack_break = true;
            }
            _ => {}
        }
        return;
    }

    if event.kind == EventKind::SysComSongSelect || event.kind == EventKind::SysComSongPosition {
        return;
    }

    let channel = event.channel as usize;
    if channel >= NUM_CHANNELS {
        return;
    }

    *status = 1;

    match event.kind {
        EventKind::NoteOff | EventKind::NoteOn if channel_disabled[channel] => {}
        EventKind::Unknown => {}
        _ => engine.channel_event(event),
    }
}

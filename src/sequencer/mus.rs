use phf::phf_ordered_map;
use tracing::debug;

use crate::dtype::SynthError;

/// DMX MUS controller numbers to MIDI continuous controllers. Entries 0 and
/// 15 have no MIDI counterpart (0 is the patch change, handled separately).
static MUS_CONTROLLER_MAP: phf::OrderedMap<u8, u8> = phf_ordered_map! {
    1u8 => 0u8,   // bank select
    2u8 => 1u8,   // modulation
    3u8 => 7u8,   // volume
    4u8 => 10u8,  // pan
    5u8 => 11u8,  // expression
    6u8 => 91u8,  // reverb depth
    7u8 => 93u8,  // chorus depth
    8u8 => 64u8,  // sustain
    9u8 => 67u8,  // soft pedal
    10u8 => 120u8, // all sound off
    11u8 => 123u8, // all notes off
    12u8 => 126u8, // mono
    13u8 => 127u8, // poly
    14u8 => 121u8, // reset all controllers
};

const MUS_MAGIC: &[u8; 4] = b"MUS\x1A";
const SMF_TICKS: u16 = 70;

/// One in-progress MUS to SMF type-0 conversion. The converted bytes are
/// deterministic for a given input.
pub struct MusConverter<'a> {
    data: &'a [u8],
    pos: usize,
    out: Vec<u8>,
    eot: bool,
    delta_bytes: [u8; 4],
    delta_count: usize,
    channel_volumes: [u8; 16],
}

pub fn mus_to_midi(data: &[u8]) -> Result<Vec<u8>, SynthError> {
    MusConverter::new(data)?.convert()
}

impl<'a> MusConverter<'a> {
    pub fn new(data: &'a [u8]) -> Result<MusConverter<'a>, SynthError> {
        if data.len() < 8 || &data[..4] != MUS_MAGIC {
            return Err(SynthError::MalformedSong("missing MUS magic"));
        }
        let score_length = u16::from_le_bytes([data[4], data[5]]) as usize;
        let score_start = u16::from_le_bytes([data[6], data[7]]) as usize;
        if data.len() != score_start + score_length {
            return Err(SynthError::MalformedSong("MUS size does not match header"));
        }
        Ok(MusConverter {
            data,
            pos: score_start,
            out: Vec::with_capacity(data.len() * 2),
            eot: false,
            delta_bytes: [0; 4],
            delta_count: 1,
            channel_volumes: [0; 16],
        })
    }

    pub fn convert(mut self) -> Result<Vec<u8>, SynthError> {
        // SMF type-0 header with a single track at 70 ticks per quarter
        self.out.extend_from_slice(b"MThd");
        self.out.extend_from_slice(&6u32.to_be_bytes());
        self.out.extend_from_slice(&0u16.to_be_bytes());
        self.out.extend_from_slice(&1u16.to_be_bytes());
        self.out.extend_from_slice(&SMF_TICKS.to_be_bytes());
        self.out.extend_from_slice(b"MTrk");
        let track_length_offset = self.out.len();
        self.out.extend_from_slice(&[0u8; 4]);

        while !self.eot {
            self.convert_event()?;
        }

        let track_length = (self.out.len() - track_length_offset - 4) as u32;
        self.out[track_length_offset..track_length_offset + 4].copy_from_slice(&track_length.to_be_bytes());
        Ok(self.out)
    }

    fn next(&mut self) -> Result<u8, SynthError> {
        let byte = *self.data.get(self.pos).ok_or(SynthError::MalformedSong("truncated MUS event"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn convert_event(&mut self) -> Result<(), SynthError> {
        let descriptor = self.next()?;
        let mut last = descriptor & 0x80;
        let channel = descriptor & 0x0F;

        let mut event = [0u8; 3];
        let count;
        match descriptor & 0x70 {
            0x00 => {
                event[0] = 0x80;
                event[1] = self.next()? & 0x7F;
                event[2] = self.channel_volumes[channel as usize];
                count = 3;
            }
            0x10 => {
                event[0] = 0x90;
                let key = self.next()?;
                event[1] = key & 0x7F;
                event[2] = if key & 0x80 != 0 { self.next()? } else { self.channel_volumes[channel as usize] };
                self.channel_volumes[channel as usize] = event[2];
                count = 3;
            }
            0x20 => {
                event[0] = 0xE0;
                let bend = self.next()?;
                event[1] = (bend & 0x01) << 6;
                event[2] = bend >> 1;
                count = 3;
            }
            0x30 => {
                let controller = self.next()? & 0x0F;
                match MUS_CONTROLLER_MAP.get(&controller) {
                    Some(&mapped) => {
                        event[0] = 0xB0;
                        event[1] = mapped;
                        event[2] = 0x7F;
                        count = 3;
                    }
                    None => {
                        debug!(controller, "unmapped MUS system event dropped");
                        count = 0;
                    }
                }
            }
            0x40 => {
                let controller = self.next()?;
                if controller == 0 {
                    event[0] = 0xC0;
                    event[1] = self.next()?;
                    count = 2;
                } else {
                    let value = self.next()?;
                    match MUS_CONTROLLER_MAP.get(&(controller & 0x0F)) {
                        Some(&mapped) => {
                            event[0] = 0xB0;
                            event[1] = mapped;
                            event[2] = value;
                            count = 3;
                        }
                        None => {
                            debug!(controller, "unmapped MUS controller dropped");
                            count = 0;
                        }
                    }
                }
            }
            0x50 => return Ok(()),
            0x60 => {
                event[0] = 0xFF;
                event[1] = 0x2F;
                event[2] = 0x00;
                count = 3;
                // prevents the pending delta being read past the end of the
                // MUS data
                last = 0;
                self.eot = true;
            }
            _ => {
                // 0x70: unused event with one payload byte
                self.next()?;
                return Ok(());
            }
        }

        // percussion lives on channel 15 in MUS, re-route to MIDI channel 10
        let channel = match channel {
            9 => 15,
            15 => 9,
            other => other,
        };
        if count > 0 {
            event[0] |= channel;
            self.out.extend_from_slice(&self.delta_bytes[..self.delta_count]);
            self.out.extend_from_slice(&event[..count]);
        }

        if last != 0 {
            self.delta_count = 0;
            loop {
                let byte = self.next()?;
                if self.delta_count >= self.delta_bytes.len() {
                    return Err(SynthError::MalformedSong("MUS delta time too long"));
                }
                self.delta_bytes[self.delta_count] = byte;
                self.delta_count += 1;
                if byte & 0x80 == 0 {
                    break;
                }
            }
        } else {
            self.delta_bytes[0] = 0;
            self.delta_count = 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_mus(events: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MUS_MAGIC);
        out.extend_from_slice(&(events.len() as u16).to_le_bytes());
        out.extend_from_slice(&8u16.to_le_bytes());
        out.extend_from_slice(events);
        out
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(mus_to_midi(b"MUS\x00\x00\x00\x00\x00").is_err());
    }

    #[test]
    fn rejects_size_mismatch() {
        let mut mus = build_mus(&[0x60]);
        mus.push(0xAA); // trailing garbage breaks the header arithmetic
        assert!(mus_to_midi(&mus).is_err());
    }

    #[test]
    fn converts_note_on_with_velocity() {
        // note-on ch0 key 60 with explicit velocity 100, then end-of-track
        let mus = build_mus(&[0x10, 0x80 | 60, 100, 0x60]);
        let midi = mus_to_midi(&mus).unwrap();
        assert_eq!(&midi[..4], b"MThd");
        assert_eq!(u16::from_be_bytes([midi[12], midi[13]]), 70);
        assert_eq!(&midi[14..18], b"MTrk");
        // delta 0, note-on, key, velocity
        assert_eq!(&midi[22..26], &[0x00, 0x90, 60, 100]);
        // end of track meta is present
        let tail = &midi[midi.len() - 4..];
        assert_eq!(tail, &[0x00, 0xFF, 0x2F, 0x00]);
    }

    #[test]
    fn note_off_reuses_last_channel_volume() {
        let mus = build_mus(&[
            0x10, 0x80 | 62, 77, // note-on with velocity 77
            0x00, 62,            // note-off, volume should be 77
            0x60,
        ]);
        let midi = mus_to_midi(&mus).unwrap();
        let body = &midi[22..];
        assert_eq!(&body[..4], &[0x00, 0x90, 62, 77]);
        assert_eq!(&body[4..8], &[0x00, 0x80, 62, 77]);
    }

    #[test]
    fn percussion_channels_are_swapped() {
        // channel 15 in MUS is percussion; it must land on MIDI channel 9
        let mus = build_mus(&[0x1F, 0x80 | 35, 90, 0x6F]);
        let midi = mus_to_midi(&mus).unwrap();
        assert_eq!(midi[23], 0x99);
    }

    #[test]
    fn delta_times_follow_last_flag() {
        // note-on with last-bit set carries a VLQ delta of 0x40 for the next
        // event
        let mus = build_mus(&[0x90, 0x80 | 60, 100, 0x40, 0x00, 60, 0x60]);
        let midi = mus_to_midi(&mus).unwrap();
        let body = &midi[22..];
        assert_eq!(&body[..4], &[0x00, 0x90, 60, 100]);
        assert_eq!(&body[4..8], &[0x40, 0x80, 60, 100]);
    }

    #[test]
    fn conversion_is_byte_stable() {
        let mus = build_mus(&[
            0x10, 0x80 | 60, 100, 0x30, 0x03, 0x40, 0x04, 64, 0x90, 0x80 | 64, 90, 0x10, 0x00, 60, 0x60,
        ]);
        let first = mus_to_midi(&mus).unwrap();
        let second = mus_to_midi(&mus).unwrap();
        assert_eq!(first, second);
    }
}

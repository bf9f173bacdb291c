use std::io::Cursor;

use tracing::debug;

use crate::dtype::SynthError;

/// Decode a FLAC-wrapped bank back into its raw byte stream. The companion
/// encoder stores the bank's bytes as little-endian PCM frames, so the
/// decoded samples, written back little-endian, are the original file.
pub fn decode_wrapped_bank(data: &[u8]) -> Result<Vec<u8>, SynthError> {
    let mut reader = claxon::FlacReader::new(Cursor::new(data)).map_err(|_| SynthError::BankDecode)?;
    let info = reader.streaminfo();
    if info.bits_per_sample % 8 != 0 || info.bits_per_sample > 16 {
        return Err(SynthError::BankDecode);
    }
    let eight_bit = info.bits_per_sample == 8;

    debug!(
        channels = info.channels,
        bits = info.bits_per_sample,
        "unwrapping compressed bank"
    );

    let mut out = Vec::new();
    for sample in reader.samples() {
        let sample = sample.map_err(|_| SynthError::BankDecode)?;
        if eight_bit {
            out.push((sample + 128) as u8);
        } else {
            out.extend_from_slice(&(sample as i16).to_le_bytes());
        }
    }
    if out.is_empty() {
        return Err(SynthError::BankDecode);
    }
    Ok(out)
}

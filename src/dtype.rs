use std::io::{Read, Seek};
use bevy_reflect::{Reflect, Struct};
use byteorder::{ReadBytesExt, LittleEndian};
use thiserror::Error;

macro_rules! read_n_bytes {
    ($file:ident, $n:literal) => {{
        let mut buf: [u8; $n] = [0; $n];
        $file.read_exact(&mut buf).map(|_| buf)
    }};
}
#[macro_export]
macro_rules! peek_magic {
    ($file:ident) => {{
        let mut buf: [u8; 4] = [0; 4];
        $file.read_exact(&mut buf).and_then(|_| {
            $file.seek(std::io::SeekFrom::Current(-4))
        }).map(move |_| buf)
    }};
}

#[derive(Debug, Error)]
pub enum SynthError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a SoundFont file")]
    NotSoundFont,
    #[error("SoundFont version {0}.{1:02} is later than 2.04")]
    UnsupportedVersion(u16, u16),
    #[error("no sample data found")]
    MissingSampleData,
    #[error("{0} chunk size {1} is not divisible by the record stride {2}")]
    BadChunkStride(&'static str, u32, usize),
    #[error("no {0} found")]
    MissingRecords(&'static str),
    #[error("{0} indices not monotonically increasing")]
    NonMonotonicIndices(&'static str),
    #[error("sample range extends beyond the end of the sample pool")]
    SampleOutOfRange,
    #[error("truncated stream while reading {0}")]
    Truncated(&'static str),
    #[error("unrecognized song format")]
    UnknownSongFormat,
    #[error("malformed song data: {0}")]
    MalformedSong(&'static str),
    #[error("compressed bank could not be decoded")]
    BankDecode,
    #[error("record reflection failure")]
    RecordReflection,
}

/// Fixed-layout little-endian hydra record. `STRIDE` is the on-disk size,
/// which the reflection reader must consume exactly.
pub trait AutoRecord: Reflect + Struct + Default {
    const STRIDE: usize;
}

pub trait RecordRead {
    fn read_record<R: Read + Seek>(&mut self, reader: &mut R) -> Result<(), SynthError>;
}
impl<T: AutoRecord> RecordRead for T {
    fn read_record<R: Read + Seek>(&mut self, file: &mut R) -> Result<(), SynthError> {
        for field_i in 0..self.field_len() {
            let field = self.field_at_mut(field_i).ok_or(SynthError::RecordReflection)?;
            let type_info = field.get_represented_type_info().ok_or(SynthError::RecordReflection)?;
            match type_info {
                bevy_reflect::TypeInfo::Array(array_info) => {
                    let capacity = array_info.capacity();
                    if array_info.item_type_name() == "u8" {
                        if capacity == 4 {
                            *field.as_any_mut().downcast_mut::<[u8; 4]>().ok_or(SynthError::RecordReflection)? = read_n_bytes!(file, 4)?;
                        } else if capacity == 20 {
                            *field.as_any_mut().downcast_mut::<[u8; 20]>().ok_or(SynthError::RecordReflection)? = read_n_bytes!(file, 20)?;
                        } else {
                            panic!("Unsupported auto type!");
                        }
                    } else {
                        panic!("Unsupported auto type!");
                    }
                },
                bevy_reflect::TypeInfo::Value(value_info) => {
                    if value_info.type_name() == "u8" {
                        *field.as_any_mut().downcast_mut::<u8>().ok_or(SynthError::RecordReflection)? = file.read_u8()?;
                    } else if value_info.type_name() == "u16" {
                        *field.as_any_mut().downcast_mut::<u16>().ok_or(SynthError::RecordReflection)? = file.read_u16::<LittleEndian>()?;
                    } else if value_info.type_name() == "u32" {
                        *field.as_any_mut().downcast_mut::<u32>().ok_or(SynthError::RecordReflection)? = file.read_u32::<LittleEndian>()?;
                    } else if value_info.type_name() == "i8" {
                        *field.as_any_mut().downcast_mut::<i8>().ok_or(SynthError::RecordReflection)? = file.read_i8()?;
                    } else if value_info.type_name() == "i16" {
                        *field.as_any_mut().downcast_mut::<i16>().ok_or(SynthError::RecordReflection)? = file.read_i16::<LittleEndian>()?;
                    } else {
                        panic!("Unsupported auto type!");
                    }
                },
                _ => panic!("Unsupported auto type!")
            }
        }
        Ok(())
    }
}

/// Read a whole sub-chunk of fixed-stride records. The chunk size must be an
/// exact multiple of the record stride.
pub fn read_record_list<T: AutoRecord, R: Read + Seek>(
    reader: &mut R,
    total_size: u32,
    what: &'static str,
) -> Result<Vec<T>, SynthError> {
    if total_size as usize % T::STRIDE != 0 {
        return Err(SynthError::BadChunkStride(what, total_size, T::STRIDE));
    }
    let count = total_size as usize / T::STRIDE;
    let mut list = Vec::with_capacity(count);
    for _ in 0..count {
        let mut record = T::default();
        record.read_record(reader)?;
        list.push(record);
    }
    Ok(list)
}

/// Trim a fixed-width, NUL-padded record name to a `String`.
pub fn record_name(raw: &[u8; 20]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Debug, Default, Reflect)]
    struct TestRecord {
        name: [u8; 4],
        a: u16,
        b: i16,
        c: u32,
    }
    impl AutoRecord for TestRecord {
        const STRIDE: usize = 12;
    }

    #[test]
    fn record_reader_consumes_stride() {
        let bytes: Vec<u8> = vec![
            b'a', b'b', b'c', 0,
            0x34, 0x12,
            0xFF, 0xFF,
            0x78, 0x56, 0x34, 0x12,
        ];
        let mut cursor = Cursor::new(bytes);
        let mut record = TestRecord::default();
        record.read_record(&mut cursor).unwrap();
        assert_eq!(&record.name, b"abc\0");
        assert_eq!(record.a, 0x1234);
        assert_eq!(record.b, -1);
        assert_eq!(record.c, 0x12345678);
        assert_eq!(cursor.position(), TestRecord::STRIDE as u64);
    }

    #[test]
    fn record_list_rejects_bad_stride() {
        let mut cursor = Cursor::new(vec![0u8; 13]);
        let result = read_record_list::<TestRecord, _>(&mut cursor, 13, "test records");
        assert!(matches!(result, Err(SynthError::BadChunkStride("test records", 13, 12))));
    }

    #[test]
    fn record_list_reads_all_records() {
        let mut bytes = Vec::new();
        for _ in 0..3 {
            bytes.extend_from_slice(&[0u8; 12]);
        }
        let mut cursor = Cursor::new(bytes);
        let list = read_record_list::<TestRecord, _>(&mut cursor, 36, "test records").unwrap();
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn record_name_stops_at_nul() {
        let mut raw = [0u8; 20];
        raw[..5].copy_from_slice(b"Piano");
        assert_eq!(record_name(&raw), "Piano");
    }
}

use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use crate::dtype::SynthError;

/// Uniform seekable byte source over a file on disk or an owned memory
/// buffer. Everything downstream (bank loader, song parsers) reads through
/// this so the two input paths behave identically.
pub enum ByteSource {
    File(BufReader<File>, u64),
    Memory(Cursor<Vec<u8>>),
}

impl ByteSource {
    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<ByteSource, SynthError> {
        let file = File::open(path)?;
        let length = file.metadata()?.len();
        Ok(ByteSource::File(BufReader::new(file), length))
    }

    pub fn open_data(data: Vec<u8>) -> ByteSource {
        ByteSource::Memory(Cursor::new(data))
    }

    pub fn len(&self) -> u64 {
        match self {
            ByteSource::File(_, length) => *length,
            ByteSource::Memory(cursor) => cursor.get_ref().len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tell(&mut self) -> Result<u64, SynthError> {
        Ok(self.stream_position()?)
    }

    pub fn eof(&mut self) -> Result<bool, SynthError> {
        Ok(self.tell()? >= self.len())
    }

    /// Read everything from the current position to the end.
    pub fn read_remaining(&mut self) -> Result<Vec<u8>, SynthError> {
        let mut data = Vec::new();
        self.read_to_end(&mut data)?;
        Ok(data)
    }
}

impl Read for ByteSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ByteSource::File(reader, _) => reader.read(buf),
            ByteSource::Memory(cursor) => cursor.read(buf),
        }
    }
}

impl Seek for ByteSource {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        match self {
            ByteSource::File(reader, _) => reader.seek(pos),
            ByteSource::Memory(cursor) => cursor.seek(pos),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn memory_source_reads_and_seeks() {
        let mut source = ByteSource::open_data(vec![1, 2, 3, 4, 5]);
        assert_eq!(source.len(), 5);
        let mut buf = [0u8; 2];
        source.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2]);
        assert_eq!(source.tell().unwrap(), 2);
        source.seek(SeekFrom::Start(4)).unwrap();
        source.read_exact(&mut buf[..1]).unwrap();
        assert_eq!(buf[0], 5);
        assert!(source.eof().unwrap());
    }

    #[test]
    fn file_source_matches_memory_source() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[9, 8, 7, 6]).unwrap();
        let mut source = ByteSource::open_file(tmp.path()).unwrap();
        assert_eq!(source.len(), 4);
        assert_eq!(source.read_remaining().unwrap(), vec![9, 8, 7, 6]);
        assert!(source.eof().unwrap());
    }

    #[test]
    fn peek_does_not_advance() {
        let mut source = ByteSource::open_data(b"RIFFrest".to_vec());
        let magic = crate::peek_magic!(source).unwrap();
        assert_eq!(&magic, b"RIFF");
        assert_eq!(source.tell().unwrap(), 0);
    }
}

//! Zstandard-compressed transports: decompression is streamed on read, and
//! the writer closes the frame on finish so the output is a valid standalone
//! `.zst` file.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};

use super::{PortReader, StreamWriter};
use crate::errors::{IngestError, Result};

/// Compression level for output streams. Matches the speed-oriented setting
/// used for raw voltage capture, where ratios are modest anyway.
const COMPRESSION_LEVEL: i32 = 3;

pub struct ZstdReader {
    inner: ::zstd::stream::read::Decoder<'static, BufReader<File>>,
}

impl ZstdReader {
    pub fn open(path: &str, port: usize) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| IngestError::io(format!("port {port}: open {path}"), e))?;
        let decoder = ::zstd::stream::read::Decoder::new(file)
            .map_err(|e| IngestError::io(format!("port {port}: zstd stream {path}"), e))?;
        Ok(Self { inner: decoder })
    }
}

impl PortReader for ZstdReader {
    fn read_into(&mut self, dst: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(dst)
    }
}

pub struct ZstdWriter {
    inner: ::zstd::stream::write::Encoder<'static, BufWriter<File>>,
}

impl ZstdWriter {
    pub fn create(path: &str, stream: usize) -> Result<Self> {
        let file = File::create(path)
            .map_err(|e| IngestError::io(format!("stream {stream}: create {path}"), e))?;
        let encoder = ::zstd::stream::write::Encoder::new(BufWriter::new(file), COMPRESSION_LEVEL)
            .map_err(|e| IngestError::io(format!("stream {stream}: zstd encoder {path}"), e))?;
        Ok(Self { inner: encoder })
    }
}

impl StreamWriter for ZstdWriter {
    fn write_all(&mut self, src: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(src)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }

    fn finish(self: Box<Self>) -> std::io::Result<()> {
        let mut file = self.inner.finish()?;
        file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::read_fully;

    #[test]
    fn test_zstd_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.zst");
        let path = path.to_str().unwrap();

        let payload: Vec<u8> = (0..10_000u32).map(|v| (v % 251) as u8).collect();
        let mut writer = Box::new(ZstdWriter::create(path, 0).unwrap());
        writer.write_all(&payload).unwrap();
        writer.finish().unwrap();

        // the file on disk is compressed
        assert!(std::fs::metadata(path).unwrap().len() < payload.len() as u64);

        let mut reader = ZstdReader::open(path, 0).unwrap();
        let mut buf = vec![0u8; payload.len() + 16];
        let n = read_fully(&mut reader, &mut buf).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(&buf[..n], &payload[..]);
    }

    #[test]
    fn test_zstd_reader_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.zst");
        std::fs::write(&path, b"not a zstd frame").unwrap();

        // the error surfaces on first read
        let reader = ZstdReader::open(path.to_str().unwrap(), 0);
        match reader {
            Ok(mut r) => {
                let mut buf = [0u8; 64];
                assert!(read_fully(&mut r, &mut buf).is_err());
            }
            Err(_) => {}
        }
    }
}

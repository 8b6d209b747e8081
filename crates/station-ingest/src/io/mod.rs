//! Pluggable input and output transports.
//!
//! Readers expose "deliver as many bytes as possible from port i or EOF";
//! writers expose "append N bytes to output stream i". Targets are described
//! by a format string with an optional transport prefix and substitutable
//! fields: `[[port]]`, `[[iter]]`, `[[idx]]`, `[[pack]]`.
//!
//! ```text
//! udp_[[port]].raw              flat file (default)
//! file:/data/udp_[[port]].raw   flat file, explicit
//! fifo:/tmp/feed_[[port]]       named pipe
//! zstd:/data/udp_[[port]].zst   Zstandard stream (also guessed from .zst)
//! shm:41070                     shared-memory ring keyed at 41070 + index
//! ```

pub mod fifo;
pub mod file;
pub mod shm;
pub mod zstd;

use crate::errors::{IngestError, Result};

/// One input port's byte stream.
pub trait PortReader: Send {
    /// Fill as much of `dst` as the stream allows; short counts mean EOF.
    fn read_into(&mut self, dst: &mut [u8]) -> std::io::Result<usize>;
}

/// One output stream.
pub trait StreamWriter: Send {
    fn write_all(&mut self, src: &[u8]) -> std::io::Result<()>;
    fn flush(&mut self) -> std::io::Result<()>;
    /// Finish the stream (flush trailers, close compression frames).
    fn finish(self: Box<Self>) -> std::io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    File,
    Fifo,
    Zstd,
    Shm,
}

/// A parsed transport spec: the transport plus the unexpanded target string.
#[derive(Debug, Clone)]
pub struct IoSpec {
    pub transport: Transport,
    pub template: String,
}

impl IoSpec {
    /// Parse `[transport:]target`. Unknown prefixes that look like transport
    /// selectors are rejected rather than treated as file paths.
    pub fn parse(spec: &str) -> Result<Self> {
        let (transport, template) = match spec.split_once(':') {
            Some(("file", rest)) => (Transport::File, rest),
            Some(("fifo", rest)) => (Transport::Fifo, rest),
            Some(("zstd", rest)) => (Transport::Zstd, rest),
            Some(("shm", rest)) => (Transport::Shm, rest),
            Some((prefix, _))
                if prefix.len() <= 6 && prefix.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                return Err(IngestError::Usage(format!("unsupported transport '{prefix}'")));
            }
            _ => {
                let transport =
                    if spec.ends_with(".zst") { Transport::Zstd } else { Transport::File };
                (transport, spec)
            }
        };
        if template.is_empty() {
            return Err(IngestError::Usage(format!("empty target in spec '{spec}'")));
        }
        Ok(Self { transport, template: template.to_string() })
    }

    /// True when the target changes between iterations and the writer must
    /// reopen per iteration.
    pub fn rotates(&self) -> bool {
        self.template.contains("[[iter]]")
    }

    pub fn target_for(&self, port: usize, iter: usize, idx: usize, pack: i64) -> String {
        expand_template(&self.template, port, iter, idx, pack)
    }
}

/// Substitute the `[[...]]` fields of a target template.
pub fn expand_template(template: &str, port: usize, iter: usize, idx: usize, pack: i64) -> String {
    template
        .replace("[[port]]", &port.to_string())
        .replace("[[iter]]", &iter.to_string())
        .replace("[[idx]]", &idx.to_string())
        .replace("[[pack]]", &pack.to_string())
}

/// Open the reader for one input port.
pub fn open_reader(spec: &IoSpec, port: usize, packet_len: usize) -> Result<Box<dyn PortReader>> {
    let target = spec.target_for(port, 0, port, 0);
    match spec.transport {
        Transport::File => Ok(Box::new(file::FileReader::open(&target, port)?)),
        Transport::Fifo => Ok(Box::new(fifo::FifoReader::open(&target, port)?)),
        Transport::Zstd => Ok(Box::new(zstd::ZstdReader::open(&target, port)?)),
        Transport::Shm => Ok(Box::new(shm::ShmReader::attach(parse_shm_key(&target)?, port, packet_len)?)),
    }
}

/// Open the writer for one output stream.
pub fn open_writer(
    spec: &IoSpec,
    stream: usize,
    iter: usize,
    first_packet: i64,
) -> Result<Box<dyn StreamWriter>> {
    let target = spec.target_for(stream, iter, stream, first_packet);
    match spec.transport {
        Transport::File => Ok(Box::new(file::FileWriter::create(&target, stream)?)),
        Transport::Fifo => Ok(Box::new(fifo::FifoWriter::create(&target, stream)?)),
        Transport::Zstd => Ok(Box::new(zstd::ZstdWriter::create(&target, stream)?)),
        Transport::Shm => Ok(Box::new(shm::ShmWriter::create(parse_shm_key(&target)?, stream)?)),
    }
}

fn parse_shm_key(target: &str) -> Result<i32> {
    target
        .parse::<i32>()
        .map_err(|_| IngestError::Usage(format!("shared-memory key '{target}' is not an integer")))
}

/// Read until `dst` is full or the stream ends; returns bytes read.
pub fn read_fully(reader: &mut dyn PortReader, dst: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < dst.len() {
        match reader.read_into(&mut dst[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_parse_prefixes() {
        assert_eq!(IoSpec::parse("udp.raw").unwrap().transport, Transport::File);
        assert_eq!(IoSpec::parse("file:udp.raw").unwrap().transport, Transport::File);
        assert_eq!(IoSpec::parse("fifo:/tmp/feed").unwrap().transport, Transport::Fifo);
        assert_eq!(IoSpec::parse("zstd:/x.zst").unwrap().transport, Transport::Zstd);
        assert_eq!(IoSpec::parse("shm:41070").unwrap().transport, Transport::Shm);
        // extension sniffing without a prefix
        assert_eq!(IoSpec::parse("capture.zst").unwrap().transport, Transport::Zstd);
        // paths keep their colons when the prefix is not a transport name
        assert_eq!(
            IoSpec::parse("/data/obs:2024/udp.raw").unwrap().transport,
            Transport::File
        );
    }

    #[test]
    fn test_spec_parse_rejects_unknown_transport() {
        assert!(IoSpec::parse("dada:41070").is_err());
        assert!(IoSpec::parse("hdf5:obs.h5").is_err());
        assert!(IoSpec::parse("file:").is_err());
    }

    #[test]
    fn test_template_expansion() {
        let spec = IoSpec::parse("out_[[port]]_[[iter]]_[[idx]]_[[pack]].raw").unwrap();
        assert_eq!(spec.target_for(2, 7, 1, 3_551_202), "out_2_7_1_3551202.raw");
        assert!(spec.rotates());
        assert!(!IoSpec::parse("out_[[port]].raw").unwrap().rotates());
    }
}

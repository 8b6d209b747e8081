//! CEP packet header decoding.
//!
//! Every station packet starts with a fixed 16-byte header followed by
//! 16 timeslices × beamlets × 2 polarisations × 2 quadrature components.
//! We parse the binary layout directly using the stable RSP wire format.
//!
//! Header layout:
//!   Byte   0         = RSP version (always 3)
//!   Bytes  1 ..   2  = source (u16 LE, bit-packed: 5 rsp-id, 1 reserved,
//!                      1 error, 1 clock-200/160, 2 bit mode, 6 reserved)
//!   Bytes  4 ..   5  = station id (u16 LE)
//!   Byte   6         = beamlets per packet
//!   Byte   7         = timeslices per packet (always 16)
//!   Bytes  8 ..  11  = coarse timestamp, Unix seconds (u32 LE)
//!   Bytes 12 ..  15  = sequence, sample ticks into the second (u32 LE)

use crate::errors::{IngestError, Result};

/// Maximum number of parallel input ports.
pub const MAX_PORTS: usize = 4;
/// Maximum number of output streams produced by any layout.
pub const MAX_OUTPUTS: usize = 4;
/// Fixed packet header length in bytes.
pub const HDR_LEN: usize = 16;
/// RSP packet version this pipeline understands.
pub const RSP_VERSION: u8 = 3;
/// Upper bound on beamlets carried in one packet.
pub const MAX_BEAMLETS: usize = 244;
/// Polarisation components per sample: Xr, Xi, Yr, Yi.
pub const N_POL: usize = 4;
/// Time samples per packet.
pub const N_TIMESLICE: usize = 16;

/// 2008-01-01 UTC; no valid observation predates it.
pub const STATION_EPOCH: u32 = 1_199_145_600;

/// Largest valid sequence value per clock (ticks in one second, rounded up).
pub const MAX_SEQUENCE_200MHZ: u32 = 195_313;
pub const MAX_SEQUENCE_160MHZ: u32 = 156_250;

const SRC_OFF: usize = 1; // u16 LE
const STN_OFF: usize = 4; // u16 LE
const NBEAM_OFF: usize = 6;
const NSLICE_OFF: usize = 7;
const TIME_OFF: usize = 8; // u32 LE
const SEQ_OFF: usize = 12; // u32 LE

/// Bit set in the upper source byte of padded packets so downstream tooling
/// can recognise synthesised headers. The bit lands in the reserved region of
/// the source field.
pub const PAD_MARKER: u8 = 0x80;

/// Sample width of the packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BitMode {
    Bit4,
    Bit8,
    Bit16,
}

impl BitMode {
    fn from_source(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(BitMode::Bit16),
            1 => Ok(BitMode::Bit8),
            2 => Ok(BitMode::Bit4),
            _ => Err(IngestError::BitModeUnsupported(bits)),
        }
    }

    /// Payload bits per quadrature component.
    pub fn bits(self) -> usize {
        match self {
            BitMode::Bit4 => 4,
            BitMode::Bit8 => 8,
            BitMode::Bit16 => 16,
        }
    }

    /// Payload bytes for one packet carrying `beamlets` beamlets.
    pub fn payload_len(self, beamlets: usize) -> usize {
        beamlets * N_TIMESLICE * N_POL * self.bits() / 8
    }
}

/// Decoded 16-byte packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub rsp_version: u8,
    pub rsp_id: u8,
    pub error_bit: bool,
    pub clock_200mhz: bool,
    pub bit_mode: BitMode,
    pub station_id: u16,
    pub beamlets: u8,
    pub timeslices: u8,
    pub timestamp: u32,
    pub sequence: u32,
}

impl PacketHeader {
    /// Decode and sanity-check a packet header.
    ///
    /// Side-effect free and called once per packet; rejected headers are
    /// counted as drops by the caller, never fatal.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HDR_LEN {
            return Err(IngestError::MalformedHeader("short header"));
        }
        let rsp_version = bytes[0];
        if rsp_version != RSP_VERSION {
            return Err(IngestError::MalformedHeader("unexpected RSP version"));
        }

        let source = u16::from_le_bytes([bytes[SRC_OFF], bytes[SRC_OFF + 1]]);
        let rsp_id = (source & 0x1F) as u8;
        let error_bit = source & 0x40 != 0;
        let clock_200mhz = source & 0x80 != 0;
        let bit_mode = BitMode::from_source(((source >> 8) & 0x03) as u8)?;

        let timestamp = u32::from_le_bytes(bytes[TIME_OFF..TIME_OFF + 4].try_into().unwrap());
        if timestamp < STATION_EPOCH {
            return Err(IngestError::MalformedHeader("timestamp before station epoch"));
        }

        let sequence = u32::from_le_bytes(bytes[SEQ_OFF..SEQ_OFF + 4].try_into().unwrap());
        let max_seq = if clock_200mhz { MAX_SEQUENCE_200MHZ } else { MAX_SEQUENCE_160MHZ };
        if sequence > max_seq {
            return Err(IngestError::MalformedHeader("sequence beyond one second of ticks"));
        }

        Ok(Self {
            rsp_version,
            rsp_id,
            error_bit,
            clock_200mhz,
            bit_mode,
            station_id: u16::from_le_bytes([bytes[STN_OFF], bytes[STN_OFF + 1]]),
            beamlets: bytes[NBEAM_OFF],
            timeslices: bytes[NSLICE_OFF],
            timestamp,
            sequence,
        })
    }

    /// The dense logical packet number used for reconciliation.
    pub fn packet_number(&self) -> i64 {
        (second_ticks(self.timestamp, self.clock_200mhz) + i64::from(self.sequence)) / 16
    }

    /// Bytes of one packet on the wire for this header's geometry.
    pub fn packet_len(&self) -> usize {
        HDR_LEN + self.bit_mode.payload_len(self.beamlets as usize)
    }
}

/// Sample ticks elapsed at the start of second `timestamp`.
///
/// The 200 MHz clock advances 195312.5 ticks per second; the integer form
/// (`ts · 10⁶ · 200 + 512) / 1024` keeps packet numbers exact across the
/// alternating 195312/195313-tick seconds.
#[inline]
pub fn second_ticks(timestamp: u32, clock_200mhz: bool) -> i64 {
    let mul: i64 = if clock_200mhz { 200 } else { 160 };
    (i64::from(timestamp) * 1_000_000 * mul + 512) / 1024
}

/// Sample ticks per second as a rate (for time→packet conversions).
#[inline]
pub fn ticks_per_second(clock_200mhz: bool) -> f64 {
    if clock_200mhz {
        195_312.5
    } else {
        156_250.0
    }
}

/// Decode just the logical packet number from a raw header.
#[inline]
pub fn packet_number(bytes: &[u8]) -> Result<i64> {
    PacketHeader::parse(bytes).map(|h| h.packet_number())
}

/// Unchecked peek at the sequence field, for the fast in-order path.
#[inline]
pub fn raw_sequence(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes[SEQ_OFF..SEQ_OFF + 4].try_into().unwrap())
}

/// The sequence value a packet numbered `packet_number` would carry if it
/// kept the coarse timestamp of `header_bytes`. Used to synthesise plausible
/// headers for padded packets; may exceed one second of ticks when the pad
/// run crosses a second boundary, exactly as a replayed header would.
pub fn sequence_for_packet(header_bytes: &[u8], packet_number: i64) -> u32 {
    let timestamp =
        u32::from_le_bytes(header_bytes[TIME_OFF..TIME_OFF + 4].try_into().unwrap());
    let clock_200mhz = header_bytes[SRC_OFF] & 0x80 != 0;
    (16 * packet_number - second_ticks(timestamp, clock_200mhz)) as u32
}

/// Logical packet number covering Unix time `t` (fractional seconds allowed).
pub fn packet_for_unix_time(t: f64, clock_200mhz: bool) -> i64 {
    (t * ticks_per_second(clock_200mhz) / 16.0) as i64
}

/// Packets spanning `seconds` of wall time, rounded up.
pub fn packets_for_duration(seconds: f64, clock_200mhz: bool) -> i64 {
    (seconds * ticks_per_second(clock_200mhz) / 16.0).ceil() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn make_header(timestamp: u32, sequence: u32, bit_mode: u8, beamlets: u8) -> [u8; HDR_LEN] {
        let mut hdr = [0u8; HDR_LEN];
        hdr[0] = RSP_VERSION;
        // source: clock bit set (200 MHz), bit mode in bits 8-9
        hdr[SRC_OFF] = 0x80;
        hdr[SRC_OFF + 1] = bit_mode;
        hdr[STN_OFF] = 901u16.to_le_bytes()[0];
        hdr[STN_OFF + 1] = 901u16.to_le_bytes()[1];
        hdr[NBEAM_OFF] = beamlets;
        hdr[NSLICE_OFF] = N_TIMESLICE as u8;
        hdr[TIME_OFF..TIME_OFF + 4].copy_from_slice(&timestamp.to_le_bytes());
        hdr[SEQ_OFF..SEQ_OFF + 4].copy_from_slice(&sequence.to_le_bytes());
        hdr
    }

    #[test]
    fn test_parse_round_trip() {
        let hdr = make_header(STATION_EPOCH + 1000, 1600, 1, 122);
        let parsed = PacketHeader::parse(&hdr).expect("valid header");
        assert_eq!(parsed.rsp_version, RSP_VERSION);
        assert!(parsed.clock_200mhz);
        assert_eq!(parsed.bit_mode, BitMode::Bit8);
        assert_eq!(parsed.station_id, 901);
        assert_eq!(parsed.beamlets, 122);
        assert_eq!(parsed.timestamp, STATION_EPOCH + 1000);
        assert_eq!(parsed.sequence, 1600);
    }

    #[test]
    fn test_parse_rejects_bad_version() {
        let mut hdr = make_header(STATION_EPOCH, 0, 1, 122);
        hdr[0] = 2;
        assert!(PacketHeader::parse(&hdr).is_err());
    }

    #[test]
    fn test_parse_rejects_pre_epoch_timestamp() {
        let hdr = make_header(STATION_EPOCH - 1, 0, 1, 122);
        assert!(PacketHeader::parse(&hdr).is_err());
    }

    #[test]
    fn test_parse_rejects_oversized_sequence() {
        let hdr = make_header(STATION_EPOCH, MAX_SEQUENCE_200MHZ + 1, 1, 122);
        assert!(PacketHeader::parse(&hdr).is_err());
    }

    #[test]
    fn test_parse_rejects_short_buffer() {
        assert!(PacketHeader::parse(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_packet_number_monotonic_across_second() {
        // Sequence advances by 16 per packet and wraps with the second.
        let t = STATION_EPOCH + 3600;
        let ticks = second_ticks(t + 1, true) - second_ticks(t, true);
        let last = PacketHeader::parse(&make_header(t, (ticks - 16) as u32, 1, 122)).unwrap();
        let first = PacketHeader::parse(&make_header(t + 1, 0, 1, 122)).unwrap();
        assert_eq!(last.packet_number() + 1, first.packet_number());
    }

    #[test]
    fn test_sequence_for_packet_matches_increment() {
        let hdr = make_header(STATION_EPOCH + 10, 320, 1, 122);
        let n = packet_number(&hdr).unwrap();
        assert_eq!(sequence_for_packet(&hdr, n + 1), 320 + 16);
        assert_eq!(sequence_for_packet(&hdr, n + 3), 320 + 48);
    }

    #[test]
    fn test_payload_len_by_bit_mode() {
        assert_eq!(BitMode::Bit16.payload_len(61), 61 * 16 * 4 * 2);
        assert_eq!(BitMode::Bit8.payload_len(122), 122 * 16 * 4);
        assert_eq!(BitMode::Bit4.payload_len(244), 244 * 16 * 4 / 2);
    }

    #[test]
    fn test_packet_for_unix_time_inverts_packet_number() {
        let hdr = make_header(STATION_EPOCH + 500, 0, 1, 122);
        let n = packet_number(&hdr).unwrap();
        let t = f64::from(STATION_EPOCH + 500);
        let approx = packet_for_unix_time(t, true);
        assert!((n - approx).abs() <= 1);
    }
}

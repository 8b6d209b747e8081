//! The transform kernel family.
//!
//! Every kernel is a monomorphised function over (input sample type, output
//! sample type, layout constants, calibrate flag). [`resolve`] maps a
//! (layout, bit mode, calibrate) triple onto one function pointer at setup;
//! the reconciler then calls that pointer once per packet, so no dispatch
//! happens inside the sample loops. 4-bit inputs are expanded to 8-bit before
//! the kernel runs and use the 8-bit instantiations.

pub(crate) mod layout;
pub(crate) mod stokes;
pub(crate) mod voltage;

use crate::buffers::{SampleKind, SharedOut};
use crate::errors::{IngestError, Result};
use crate::packet::{BitMode, HDR_LEN, N_POL, N_TIMESLICE};

use voltage::{TM_ANTPOL, TM_INTERLEAVED, TM_SPLIT};

// ---------------------------------------------------------------------------
// Sample traits
// ---------------------------------------------------------------------------

/// Input payload element: loads a quadrature component as f32.
pub trait Sample: Copy + Send + Sync + 'static {
    /// Bytes per component on the wire (the reconciler's time step size).
    const BYTES: usize;
    fn load(payload: &[u8], sample_idx: usize) -> f32;
}

impl Sample for i8 {
    const BYTES: usize = 1;
    #[inline(always)]
    fn load(payload: &[u8], sample_idx: usize) -> f32 {
        payload[sample_idx] as i8 as f32
    }
}

impl Sample for i16 {
    const BYTES: usize = 2;
    #[inline(always)]
    fn load(payload: &[u8], sample_idx: usize) -> f32 {
        let b = sample_idx * 2;
        i16::from_le_bytes([payload[b], payload[b + 1]]) as f32
    }
}

/// Output stream element.
pub trait OutSample: Copy + Send + Sync + 'static {
    const KIND: SampleKind;
    fn from_f32(v: f32) -> Self;
}

impl OutSample for i8 {
    const KIND: SampleKind = SampleKind::I8;
    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v as i8
    }
}

impl OutSample for i16 {
    const KIND: SampleKind = SampleKind::I16;
    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v as i16
    }
}

impl OutSample for f32 {
    const KIND: SampleKind = SampleKind::F32;
    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v
    }
}

// ---------------------------------------------------------------------------
// Shared kernel helpers
// ---------------------------------------------------------------------------

/// Apply a beamlet's 2×2 complex Jones matrix to the raw (X, Y) pair.
#[inline(always)]
pub(crate) fn calibrate(j: &[f32], xr: f32, xi: f32, yr: f32, yi: f32) -> (f32, f32, f32, f32) {
    (
        j[0] * xr - j[1] * xi + j[2] * yr - j[3] * yi,
        j[0] * xi + j[1] * xr + j[2] * yi + j[3] * yr,
        j[4] * xr - j[5] * xi + j[6] * yr - j[7] * yi,
        j[4] * xi + j[5] * xr + j[6] * yi + j[7] * yr,
    )
}

/// The beamlet's 8-float Jones slice, or the empty slice when not calibrating.
#[inline(always)]
pub(crate) fn beamlet_jones<const CAL: bool>(jones: &[f32], beamlet_rel: usize) -> &[f32] {
    if CAL {
        &jones[beamlet_rel * 8..beamlet_rel * 8 + 8]
    } else {
        jones
    }
}

/// Load the (Xr, Xi, Yr, Yi) tuple for one timeslice, calibrated when `CAL`.
#[inline(always)]
pub(crate) fn sample_quad<I: Sample, const CAL: bool>(
    data: &[u8],
    sample_base: usize,
    ts: usize,
    jones: &[f32],
) -> (f32, f32, f32, f32) {
    let s = sample_base + ts * N_POL;
    let xr = I::load(data, s);
    let xi = I::load(data, s + 1);
    let yr = I::load(data, s + 2);
    let yi = I::load(data, s + 3);
    if CAL {
        calibrate(jones, xr, xi, yr, yi)
    } else {
        (xr, xi, yr, yi)
    }
}

// ---------------------------------------------------------------------------
// Layout table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StokesProduct {
    I,
    Q,
    U,
    V,
    /// I and V, two streams.
    IV,
    /// Full quartet, four streams.
    Iquv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StokesOrder {
    FrequencyMajor,
    ReversedFrequencyMajor,
    TimeMajor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeMajorStreams {
    /// Single stream, 4-pol interleaved.
    Interleaved,
    /// Four streams, one per component.
    SplitPol,
    /// Two streams, each antenna's quadratures interleaved.
    AntPol,
    /// As `AntPol` but always f32 output.
    AntPolFloat,
}

/// Output layout, decoded from the numeric processing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    PacketCopy,
    PacketCopyNoHeader,
    SplitPol,
    FrequencyMajor { reversed: bool, split: bool },
    TimeMajor(TimeMajorStreams),
    Stokes { product: StokesProduct, order: StokesOrder, decimation: usize },
}

impl Layout {
    /// Decode the numeric processing mode of the CLI surface.
    pub fn from_mode(mode: i32) -> Result<Layout> {
        let layout = match mode {
            0 => Layout::PacketCopy,
            1 => Layout::PacketCopyNoHeader,
            2 => Layout::SplitPol,
            10 => Layout::FrequencyMajor { reversed: false, split: false },
            11 => Layout::FrequencyMajor { reversed: false, split: true },
            20 => Layout::FrequencyMajor { reversed: true, split: false },
            21 => Layout::FrequencyMajor { reversed: true, split: true },
            30 => Layout::TimeMajor(TimeMajorStreams::Interleaved),
            31 => Layout::TimeMajor(TimeMajorStreams::SplitPol),
            32 => Layout::TimeMajor(TimeMajorStreams::AntPol),
            35 => Layout::TimeMajor(TimeMajorStreams::AntPolFloat),
            100..=164 | 200..=264 | 300..=364 => {
                let order = match mode / 100 {
                    1 => StokesOrder::FrequencyMajor,
                    2 => StokesOrder::ReversedFrequencyMajor,
                    _ => StokesOrder::TimeMajor,
                };
                let rem = mode % 100;
                let product = match rem / 10 {
                    0 => StokesProduct::I,
                    1 => StokesProduct::Q,
                    2 => StokesProduct::U,
                    3 => StokesProduct::V,
                    5 => StokesProduct::Iquv,
                    6 => StokesProduct::IV,
                    _ => return Err(IngestError::ModeUnsupported(mode)),
                };
                let ds_exp = rem % 10;
                if ds_exp > 4 {
                    return Err(IngestError::ModeUnsupported(mode));
                }
                Layout::Stokes { product, order, decimation: 1usize << ds_exp }
            }
            _ => return Err(IngestError::ModeUnsupported(mode)),
        };
        Ok(layout)
    }

    /// Raw packet copies keep one stream per port and skip beamlet selection.
    pub fn is_raw(&self) -> bool {
        matches!(self, Layout::PacketCopy | Layout::PacketCopyNoHeader)
    }

    pub fn output_streams(&self, num_ports: usize) -> usize {
        match self {
            Layout::PacketCopy | Layout::PacketCopyNoHeader => num_ports,
            Layout::SplitPol => 4,
            Layout::FrequencyMajor { split, .. } => {
                if *split {
                    4
                } else {
                    1
                }
            }
            Layout::TimeMajor(streams) => match streams {
                TimeMajorStreams::Interleaved => 1,
                TimeMajorStreams::SplitPol => 4,
                TimeMajorStreams::AntPol | TimeMajorStreams::AntPolFloat => 2,
            },
            Layout::Stokes { product, .. } => match product {
                StokesProduct::Iquv => 4,
                StokesProduct::IV => 2,
                _ => 1,
            },
        }
    }

    /// Element type of the output streams.
    pub fn out_kind(&self, bit_mode: BitMode, calibrate: bool) -> SampleKind {
        match self {
            Layout::PacketCopy | Layout::PacketCopyNoHeader => SampleKind::I8,
            Layout::Stokes { .. } | Layout::TimeMajor(TimeMajorStreams::AntPolFloat) => SampleKind::F32,
            _ if calibrate => SampleKind::F32,
            _ => match bit_mode {
                BitMode::Bit16 => SampleKind::I16,
                _ => SampleKind::I8,
            },
        }
    }

    /// Bytes of one packet's worth of output in each stream. Raw layouts are
    /// per-port (`port_packet_len`); everything else spans the merged beamlet
    /// axis.
    pub fn packet_output_len(
        &self,
        bit_mode: BitMode,
        calibrate: bool,
        total_beamlets: usize,
        port_packet_len: usize,
    ) -> usize {
        let osize = self.out_kind(bit_mode, calibrate).bytes();
        match self {
            Layout::PacketCopy => port_packet_len,
            Layout::PacketCopyNoHeader => port_packet_len - HDR_LEN,
            Layout::SplitPol => total_beamlets * N_TIMESLICE * osize,
            Layout::FrequencyMajor { split, .. } => {
                let comps = if *split { 1 } else { N_POL };
                total_beamlets * N_TIMESLICE * comps * osize
            }
            Layout::TimeMajor(streams) => {
                let comps = match streams {
                    TimeMajorStreams::Interleaved => N_POL,
                    TimeMajorStreams::SplitPol => 1,
                    TimeMajorStreams::AntPol | TimeMajorStreams::AntPolFloat => N_POL / 2,
                };
                total_beamlets * N_TIMESLICE * comps * osize
            }
            Layout::Stokes { decimation, .. } => total_beamlets * (N_TIMESLICE / decimation) * osize,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Per-port geometry fixed at setup and shared by every kernel invocation.
#[derive(Debug, Clone)]
pub struct PortShape {
    /// First selected beamlet within this port's packet.
    pub base_beamlet: usize,
    /// One past the last selected beamlet within this port's packet.
    pub upper_beamlet: usize,
    /// Selected beamlets on earlier ports.
    pub cumulative_beamlets: usize,
    /// Selected beamlets across all ports.
    pub total_beamlets: usize,
    /// Output shape of time-major layouts.
    pub packets_per_iteration: usize,
    /// Bytes of one packet's output in each stream this port writes.
    pub packet_output_len: usize,
    /// Stream index written by the raw-copy layouts (the port number).
    pub port_stream: usize,
}

/// Kernel entry point: (shape, iteration index, packet data, Jones, outputs).
pub type KernelFn = fn(&PortShape, usize, &[u8], &[f32], &SharedOut<'_>);

/// A resolved kernel plus the pre-processing it expects.
#[derive(Clone, Copy)]
pub struct KernelPlan {
    pub kernel: KernelFn,
    /// Expand 4-bit nibbles into the scratch buffer first.
    pub unpack: bool,
    /// Hand the kernel the packet header as well as the payload.
    pub include_header: bool,
    pub out_kind: SampleKind,
}

fn split_pol_fn(bit: BitMode, cal: bool) -> KernelFn {
    match (bit, cal) {
        (BitMode::Bit16, false) => voltage::split_pol::<i16, i16, false>,
        (BitMode::Bit16, true) => voltage::split_pol::<i16, f32, true>,
        (_, false) => voltage::split_pol::<i8, i8, false>,
        (_, true) => voltage::split_pol::<i8, f32, true>,
    }
}

fn channel_major_fn<const REV: bool, const SPLIT: bool>(bit: BitMode, cal: bool) -> KernelFn {
    match (bit, cal) {
        (BitMode::Bit16, false) => voltage::channel_major::<i16, i16, REV, SPLIT, false>,
        (BitMode::Bit16, true) => voltage::channel_major::<i16, f32, REV, SPLIT, true>,
        (_, false) => voltage::channel_major::<i8, i8, REV, SPLIT, false>,
        (_, true) => voltage::channel_major::<i8, f32, REV, SPLIT, true>,
    }
}

fn time_major_fn<const PK: u8>(bit: BitMode, cal: bool) -> KernelFn {
    match (bit, cal) {
        (BitMode::Bit16, false) => voltage::time_major::<i16, i16, PK, false>,
        (BitMode::Bit16, true) => voltage::time_major::<i16, f32, PK, true>,
        (_, false) => voltage::time_major::<i8, i8, PK, false>,
        (_, true) => voltage::time_major::<i8, f32, PK, true>,
    }
}

fn time_major_float_fn<const PK: u8>(bit: BitMode, cal: bool) -> KernelFn {
    match (bit, cal) {
        (BitMode::Bit16, false) => voltage::time_major::<i16, f32, PK, false>,
        (BitMode::Bit16, true) => voltage::time_major::<i16, f32, PK, true>,
        (_, false) => voltage::time_major::<i8, f32, PK, false>,
        (_, true) => voltage::time_major::<i8, f32, PK, true>,
    }
}

fn stokes_single_input<const PROD: u8, const ORDER: u8, const FACTOR: usize>(
    bit: BitMode,
    cal: bool,
) -> KernelFn {
    match (bit, cal) {
        (BitMode::Bit16, false) => stokes::single::<i16, PROD, ORDER, FACTOR, false>,
        (BitMode::Bit16, true) => stokes::single::<i16, PROD, ORDER, FACTOR, true>,
        (_, false) => stokes::single::<i8, PROD, ORDER, FACTOR, false>,
        (_, true) => stokes::single::<i8, PROD, ORDER, FACTOR, true>,
    }
}

fn stokes_single_factor<const PROD: u8, const ORDER: u8>(
    factor: usize,
    bit: BitMode,
    cal: bool,
) -> KernelFn {
    match factor {
        1 => stokes_single_input::<PROD, ORDER, 1>(bit, cal),
        2 => stokes_single_input::<PROD, ORDER, 2>(bit, cal),
        4 => stokes_single_input::<PROD, ORDER, 4>(bit, cal),
        8 => stokes_single_input::<PROD, ORDER, 8>(bit, cal),
        _ => stokes_single_input::<PROD, ORDER, 16>(bit, cal),
    }
}

fn stokes_single_order<const PROD: u8>(
    order: StokesOrder,
    factor: usize,
    bit: BitMode,
    cal: bool,
) -> KernelFn {
    match order {
        StokesOrder::FrequencyMajor => stokes_single_factor::<PROD, 0>(factor, bit, cal),
        StokesOrder::ReversedFrequencyMajor => stokes_single_factor::<PROD, 1>(factor, bit, cal),
        StokesOrder::TimeMajor => stokes_single_factor::<PROD, 2>(factor, bit, cal),
    }
}

fn stokes_pair_input<const ORDER: u8, const FACTOR: usize>(bit: BitMode, cal: bool) -> KernelFn {
    match (bit, cal) {
        (BitMode::Bit16, false) => stokes::pair::<i16, ORDER, FACTOR, false>,
        (BitMode::Bit16, true) => stokes::pair::<i16, ORDER, FACTOR, true>,
        (_, false) => stokes::pair::<i8, ORDER, FACTOR, false>,
        (_, true) => stokes::pair::<i8, ORDER, FACTOR, true>,
    }
}

fn stokes_pair_factor<const ORDER: u8>(factor: usize, bit: BitMode, cal: bool) -> KernelFn {
    match factor {
        1 => stokes_pair_input::<ORDER, 1>(bit, cal),
        2 => stokes_pair_input::<ORDER, 2>(bit, cal),
        4 => stokes_pair_input::<ORDER, 4>(bit, cal),
        8 => stokes_pair_input::<ORDER, 8>(bit, cal),
        _ => stokes_pair_input::<ORDER, 16>(bit, cal),
    }
}

fn stokes_quad_input<const ORDER: u8, const FACTOR: usize>(bit: BitMode, cal: bool) -> KernelFn {
    match (bit, cal) {
        (BitMode::Bit16, false) => stokes::quad::<i16, ORDER, FACTOR, false>,
        (BitMode::Bit16, true) => stokes::quad::<i16, ORDER, FACTOR, true>,
        (_, false) => stokes::quad::<i8, ORDER, FACTOR, false>,
        (_, true) => stokes::quad::<i8, ORDER, FACTOR, true>,
    }
}

fn stokes_quad_factor<const ORDER: u8>(factor: usize, bit: BitMode, cal: bool) -> KernelFn {
    match factor {
        1 => stokes_quad_input::<ORDER, 1>(bit, cal),
        2 => stokes_quad_input::<ORDER, 2>(bit, cal),
        4 => stokes_quad_input::<ORDER, 4>(bit, cal),
        8 => stokes_quad_input::<ORDER, 8>(bit, cal),
        _ => stokes_quad_input::<ORDER, 16>(bit, cal),
    }
}

fn stokes_fn(
    product: StokesProduct,
    order: StokesOrder,
    factor: usize,
    bit: BitMode,
    cal: bool,
) -> KernelFn {
    use stokes::{PROD_I, PROD_Q, PROD_U, PROD_V};
    match product {
        StokesProduct::I => stokes_single_order::<PROD_I>(order, factor, bit, cal),
        StokesProduct::Q => stokes_single_order::<PROD_Q>(order, factor, bit, cal),
        StokesProduct::U => stokes_single_order::<PROD_U>(order, factor, bit, cal),
        StokesProduct::V => stokes_single_order::<PROD_V>(order, factor, bit, cal),
        StokesProduct::IV => match order {
            StokesOrder::FrequencyMajor => stokes_pair_factor::<0>(factor, bit, cal),
            StokesOrder::ReversedFrequencyMajor => stokes_pair_factor::<1>(factor, bit, cal),
            StokesOrder::TimeMajor => stokes_pair_factor::<2>(factor, bit, cal),
        },
        StokesProduct::Iquv => match order {
            StokesOrder::FrequencyMajor => stokes_quad_factor::<0>(factor, bit, cal),
            StokesOrder::ReversedFrequencyMajor => stokes_quad_factor::<1>(factor, bit, cal),
            StokesOrder::TimeMajor => stokes_quad_factor::<2>(factor, bit, cal),
        },
    }
}

/// Resolve the kernel for a (layout, bit mode, calibrate) triple.
///
/// Combinations outside the registered table fail here, at setup, never in
/// the processing loop.
pub fn resolve(layout: Layout, bit_mode: BitMode, calibrate: bool) -> Result<KernelPlan> {
    // The effective input element type: 4-bit payloads are expanded to 8-bit
    // before any non-raw kernel runs.
    let unpack = bit_mode == BitMode::Bit4 && !layout.is_raw();
    let eff_bit = if unpack { BitMode::Bit8 } else { bit_mode };
    let out_kind = layout.out_kind(bit_mode, calibrate);

    let kernel: KernelFn = match layout {
        Layout::PacketCopy | Layout::PacketCopyNoHeader => {
            if calibrate {
                // Raw copies carry no per-beamlet structure to calibrate.
                return Err(IngestError::Usage(
                    "calibration cannot be applied to raw packet copies".into(),
                ));
            }
            voltage::packet_copy
        }
        Layout::SplitPol => split_pol_fn(eff_bit, calibrate),
        Layout::FrequencyMajor { reversed: false, split: false } => {
            channel_major_fn::<false, false>(eff_bit, calibrate)
        }
        Layout::FrequencyMajor { reversed: false, split: true } => {
            channel_major_fn::<false, true>(eff_bit, calibrate)
        }
        Layout::FrequencyMajor { reversed: true, split: false } => {
            channel_major_fn::<true, false>(eff_bit, calibrate)
        }
        Layout::FrequencyMajor { reversed: true, split: true } => {
            channel_major_fn::<true, true>(eff_bit, calibrate)
        }
        Layout::TimeMajor(TimeMajorStreams::Interleaved) => {
            time_major_fn::<TM_INTERLEAVED>(eff_bit, calibrate)
        }
        Layout::TimeMajor(TimeMajorStreams::SplitPol) => time_major_fn::<TM_SPLIT>(eff_bit, calibrate),
        Layout::TimeMajor(TimeMajorStreams::AntPol) => time_major_fn::<TM_ANTPOL>(eff_bit, calibrate),
        Layout::TimeMajor(TimeMajorStreams::AntPolFloat) => {
            time_major_float_fn::<TM_ANTPOL>(eff_bit, calibrate)
        }
        Layout::Stokes { product, order, decimation } => {
            stokes_fn(product, order, decimation, eff_bit, calibrate)
        }
    };

    Ok(KernelPlan {
        kernel,
        unpack,
        include_header: layout == Layout::PacketCopy,
        out_kind,
    })
}

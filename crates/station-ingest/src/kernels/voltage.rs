//! Voltage reorder kernels: packet copies, polarisation splits, and the
//! frequency-/time-major rearrangements. One monomorphised function per
//! layout; the sample loop carries no data-dependent branches.

use super::layout::*;
use super::{beamlet_jones, sample_quad, OutSample, PortShape, Sample};
use crate::buffers::SharedOut;
use crate::packet::{N_POL, N_TIMESLICE};

/// Packet copy, with or without the header already stripped by the caller.
/// Raw layouts keep one stream per port.
pub(crate) fn packet_copy(
    shape: &PortShape,
    iloop: usize,
    data: &[u8],
    _jones: &[f32],
    out: &SharedOut<'_>,
) {
    let off = iloop * shape.packet_output_len;
    out.copy_bytes(shape.port_stream, off, &data[..shape.packet_output_len]);
}

/// Split polarisations into four streams, 16 timeslices contiguous per
/// beamlet, beamlets packed.
pub(crate) fn split_pol<I: Sample, O: OutSample, const CAL: bool>(
    shape: &PortShape,
    iloop: usize,
    data: &[u8],
    jones: &[f32],
    out: &SharedOut<'_>,
) {
    let packet_elems = shape.packet_output_len / std::mem::size_of::<O>();
    let packet_offset = iloop * packet_elems;

    for beamlet in shape.base_beamlet..shape.upper_beamlet {
        let in_base = input_sample_base(beamlet);
        let out_base = frequency_major_index(
            packet_offset,
            beamlet,
            shape.base_beamlet,
            shape.cumulative_beamlets,
            N_TIMESLICE,
        );
        let bj = beamlet_jones::<CAL>(jones, beamlet - shape.base_beamlet);

        for ts in 0..N_TIMESLICE {
            let (xr, xi, yr, yi) = sample_quad::<I, CAL>(data, in_base, ts, bj);
            let o = out_base + ts;
            out.put(0, o, O::from_f32(xr));
            out.put(1, o, O::from_f32(xi));
            out.put(2, o, O::from_f32(yr));
            out.put(3, o, O::from_f32(yi));
        }
    }
}

/// Frequency-major rearrangement: outer axis beamlet, inner axis time.
/// `REV` flips the beamlet order, `SPLIT` fans the four polarisation
/// components out to their own streams.
pub(crate) fn channel_major<I: Sample, O: OutSample, const REV: bool, const SPLIT: bool, const CAL: bool>(
    shape: &PortShape,
    iloop: usize,
    data: &[u8],
    jones: &[f32],
    out: &SharedOut<'_>,
) {
    let packet_elems = shape.packet_output_len / std::mem::size_of::<O>();
    let packet_offset = iloop * packet_elems;
    let stride = if SPLIT { 1 } else { N_POL };
    let time_advance = shape.total_beamlets * stride;

    for beamlet in shape.base_beamlet..shape.upper_beamlet {
        let in_base = input_sample_base(beamlet);
        let out_base = if REV {
            reversed_frequency_major_index(
                packet_offset,
                shape.total_beamlets,
                beamlet,
                shape.base_beamlet,
                shape.cumulative_beamlets,
                stride,
            )
        } else {
            frequency_major_index(
                packet_offset,
                beamlet,
                shape.base_beamlet,
                shape.cumulative_beamlets,
                stride,
            )
        };
        let bj = beamlet_jones::<CAL>(jones, beamlet - shape.base_beamlet);

        for ts in 0..N_TIMESLICE {
            let (xr, xi, yr, yi) = sample_quad::<I, CAL>(data, in_base, ts, bj);
            let o = out_base + ts * time_advance;
            if SPLIT {
                out.put(0, o, O::from_f32(xr));
                out.put(1, o, O::from_f32(xi));
                out.put(2, o, O::from_f32(yr));
                out.put(3, o, O::from_f32(yi));
            } else {
                out.put(0, o, O::from_f32(xr));
                out.put(0, o + 1, O::from_f32(xi));
                out.put(0, o + 2, O::from_f32(yr));
                out.put(0, o + 3, O::from_f32(yi));
            }
        }
    }
}

/// Stream arrangement of the time-major kernels.
pub(crate) const TM_INTERLEAVED: u8 = 0;
pub(crate) const TM_SPLIT: u8 = 1;
pub(crate) const TM_ANTPOL: u8 = 2;

/// Time-major rearrangement: each beamlet's samples for the whole iteration
/// are contiguous. `PK` selects single-stream 4-pol interleaved, four split
/// streams, or two per-antenna streams of interleaved quadratures.
pub(crate) fn time_major<I: Sample, O: OutSample, const PK: u8, const CAL: bool>(
    shape: &PortShape,
    iloop: usize,
    data: &[u8],
    jones: &[f32],
    out: &SharedOut<'_>,
) {
    let time_idx = iloop * N_TIMESLICE;
    let stride = match PK {
        TM_INTERLEAVED => N_POL,
        TM_ANTPOL => N_POL / 2,
        _ => 1,
    };

    for beamlet in shape.base_beamlet..shape.upper_beamlet {
        let in_base = input_sample_base(beamlet);
        let out_base = stride
            * time_major_index::<1>(
                beamlet,
                shape.base_beamlet,
                shape.cumulative_beamlets,
                shape.packets_per_iteration,
                time_idx,
            );
        let bj = beamlet_jones::<CAL>(jones, beamlet - shape.base_beamlet);

        for ts in 0..N_TIMESLICE {
            let (xr, xi, yr, yi) = sample_quad::<I, CAL>(data, in_base, ts, bj);
            let o = out_base + ts * stride;
            match PK {
                TM_INTERLEAVED => {
                    out.put(0, o, O::from_f32(xr));
                    out.put(0, o + 1, O::from_f32(xi));
                    out.put(0, o + 2, O::from_f32(yr));
                    out.put(0, o + 3, O::from_f32(yi));
                }
                TM_ANTPOL => {
                    out.put(0, o, O::from_f32(xr));
                    out.put(0, o + 1, O::from_f32(xi));
                    out.put(1, o, O::from_f32(yr));
                    out.put(1, o + 1, O::from_f32(yi));
                }
                _ => {
                    out.put(0, o, O::from_f32(xr));
                    out.put(1, o, O::from_f32(xi));
                    out.put(2, o, O::from_f32(yr));
                    out.put(3, o, O::from_f32(yi));
                }
            }
        }
    }
}

//! Stokes parameter kernels: single product, the I+V pair, and the full
//! IQUV quartet, each in three output orders and five decimation factors.
//! Decimation sums `FACTOR` consecutive Stokes samples into one output.

use super::layout::*;
use super::{beamlet_jones, sample_quad, PortShape, Sample};
use crate::buffers::SharedOut;
use crate::packet::N_TIMESLICE;

#[inline(always)]
pub(crate) fn stokes_i(xr: f32, xi: f32, yr: f32, yi: f32) -> f32 {
    xr * xr + xi * xi + yr * yr + yi * yi
}

#[inline(always)]
pub(crate) fn stokes_q(xr: f32, xi: f32, yr: f32, yi: f32) -> f32 {
    xr * xr + xi * xi - yr * yr - yi * yi
}

#[inline(always)]
pub(crate) fn stokes_u(xr: f32, xi: f32, yr: f32, yi: f32) -> f32 {
    2.0 * (xr * yr + xi * yi)
}

#[inline(always)]
pub(crate) fn stokes_v(xr: f32, xi: f32, yr: f32, yi: f32) -> f32 {
    2.0 * (xr * yi - xi * yr)
}

pub(crate) const PROD_I: u8 = 0;
pub(crate) const PROD_Q: u8 = 1;
pub(crate) const PROD_U: u8 = 2;
pub(crate) const PROD_V: u8 = 3;

#[inline(always)]
fn product<const PROD: u8>(xr: f32, xi: f32, yr: f32, yi: f32) -> f32 {
    match PROD {
        PROD_I => stokes_i(xr, xi, yr, yi),
        PROD_Q => stokes_q(xr, xi, yr, yi),
        PROD_U => stokes_u(xr, xi, yr, yi),
        _ => stokes_v(xr, xi, yr, yi),
    }
}

/// One Stokes product into one stream.
pub(crate) fn single<I: Sample, const PROD: u8, const ORDER: u8, const FACTOR: usize, const CAL: bool>(
    shape: &PortShape,
    iloop: usize,
    data: &[u8],
    jones: &[f32],
    out: &SharedOut<'_>,
) {
    let packet_elems = shape.packet_output_len / 4;
    let packet_offset = stokes_packet_offset::<ORDER, FACTOR>(iloop, packet_elems);

    for beamlet in shape.base_beamlet..shape.upper_beamlet {
        let in_base = input_sample_base(beamlet);
        let out_base = stokes_beamlet_base::<ORDER, FACTOR>(
            packet_offset,
            shape.total_beamlets,
            beamlet,
            shape.base_beamlet,
            shape.cumulative_beamlets,
            shape.packets_per_iteration,
        );
        let bj = beamlet_jones::<CAL>(jones, beamlet - shape.base_beamlet);

        for ts in 0..N_TIMESLICE / FACTOR {
            let o = stokes_time_offset::<ORDER>(out_base, ts, shape.total_beamlets);
            let mut acc = 0.0f32;
            for tss in 0..FACTOR {
                let (xr, xi, yr, yi) = sample_quad::<I, CAL>(data, in_base, ts * FACTOR + tss, bj);
                acc += product::<PROD>(xr, xi, yr, yi);
            }
            out.put(0, o, acc);
        }
    }
}

/// Stokes I and V into streams 0 and 1.
pub(crate) fn pair<I: Sample, const ORDER: u8, const FACTOR: usize, const CAL: bool>(
    shape: &PortShape,
    iloop: usize,
    data: &[u8],
    jones: &[f32],
    out: &SharedOut<'_>,
) {
    let packet_elems = shape.packet_output_len / 4;
    let packet_offset = stokes_packet_offset::<ORDER, FACTOR>(iloop, packet_elems);

    for beamlet in shape.base_beamlet..shape.upper_beamlet {
        let in_base = input_sample_base(beamlet);
        let out_base = stokes_beamlet_base::<ORDER, FACTOR>(
            packet_offset,
            shape.total_beamlets,
            beamlet,
            shape.base_beamlet,
            shape.cumulative_beamlets,
            shape.packets_per_iteration,
        );
        let bj = beamlet_jones::<CAL>(jones, beamlet - shape.base_beamlet);

        for ts in 0..N_TIMESLICE / FACTOR {
            let o = stokes_time_offset::<ORDER>(out_base, ts, shape.total_beamlets);
            let mut acc_i = 0.0f32;
            let mut acc_v = 0.0f32;
            for tss in 0..FACTOR {
                let (xr, xi, yr, yi) = sample_quad::<I, CAL>(data, in_base, ts * FACTOR + tss, bj);
                acc_i += stokes_i(xr, xi, yr, yi);
                acc_v += stokes_v(xr, xi, yr, yi);
            }
            out.put(0, o, acc_i);
            out.put(1, o, acc_v);
        }
    }
}

/// Full Stokes IQUV into streams 0..4.
pub(crate) fn quad<I: Sample, const ORDER: u8, const FACTOR: usize, const CAL: bool>(
    shape: &PortShape,
    iloop: usize,
    data: &[u8],
    jones: &[f32],
    out: &SharedOut<'_>,
) {
    let packet_elems = shape.packet_output_len / 4;
    let packet_offset = stokes_packet_offset::<ORDER, FACTOR>(iloop, packet_elems);

    for beamlet in shape.base_beamlet..shape.upper_beamlet {
        let in_base = input_sample_base(beamlet);
        let out_base = stokes_beamlet_base::<ORDER, FACTOR>(
            packet_offset,
            shape.total_beamlets,
            beamlet,
            shape.base_beamlet,
            shape.cumulative_beamlets,
            shape.packets_per_iteration,
        );
        let bj = beamlet_jones::<CAL>(jones, beamlet - shape.base_beamlet);

        for ts in 0..N_TIMESLICE / FACTOR {
            let o = stokes_time_offset::<ORDER>(out_base, ts, shape.total_beamlets);
            let mut acc = [0.0f32; 4];
            for tss in 0..FACTOR {
                let (xr, xi, yr, yi) = sample_quad::<I, CAL>(data, in_base, ts * FACTOR + tss, bj);
                acc[0] += stokes_i(xr, xi, yr, yi);
                acc[1] += stokes_q(xr, xi, yr, yi);
                acc[2] += stokes_u(xr, xi, yr, yi);
                acc[3] += stokes_v(xr, xi, yr, yi);
            }
            out.put(0, o, acc[0]);
            out.put(1, o, acc[1]);
            out.put(2, o, acc[2]);
            out.put(3, o, acc[3]);
        }
    }
}

//! Output index algebra shared by the kernel family.
//!
//! All indices are in elements of the output stream. `beamlet` is the
//! absolute beamlet index within the port's packet, `base` the first selected
//! beamlet on the port, `cumulative` the number of selected beamlets on
//! earlier ports, `total` the selected beamlets across all ports.

use crate::packet::{N_POL, N_TIMESLICE};

/// Sample index of a beamlet's first timeslice within a packet payload.
#[inline(always)]
pub(crate) fn input_sample_base(beamlet: usize) -> usize {
    beamlet * N_TIMESLICE * N_POL
}

#[inline(always)]
pub(crate) fn frequency_major_index(
    packet_offset: usize,
    beamlet: usize,
    base: usize,
    cumulative: usize,
    stride: usize,
) -> usize {
    packet_offset + (beamlet - base + cumulative) * stride
}

#[inline(always)]
pub(crate) fn reversed_frequency_major_index(
    packet_offset: usize,
    total: usize,
    beamlet: usize,
    base: usize,
    cumulative: usize,
    stride: usize,
) -> usize {
    packet_offset + (total - 1 - (beamlet - base + cumulative)) * stride
}

/// Time-major: a beamlet's samples for the whole iteration are contiguous.
#[inline(always)]
pub(crate) fn time_major_index<const FACTOR: usize>(
    beamlet: usize,
    base: usize,
    cumulative: usize,
    packets_per_iteration: usize,
    time_idx: usize,
) -> usize {
    (beamlet - base + cumulative) * packets_per_iteration * (N_TIMESLICE / FACTOR) + time_idx
}

/// Start-of-packet output offset for the Stokes kernels.
#[inline(always)]
pub(crate) fn stokes_packet_offset<const ORDER: u8, const FACTOR: usize>(
    iloop: usize,
    packet_elems: usize,
) -> usize {
    if ORDER < 2 {
        iloop * packet_elems
    } else {
        iloop * (N_TIMESLICE / FACTOR)
    }
}

/// Per-beamlet base offset for the Stokes kernels.
#[inline(always)]
pub(crate) fn stokes_beamlet_base<const ORDER: u8, const FACTOR: usize>(
    packet_offset: usize,
    total: usize,
    beamlet: usize,
    base: usize,
    cumulative: usize,
    packets_per_iteration: usize,
) -> usize {
    match ORDER {
        0 => frequency_major_index(packet_offset, beamlet, base, cumulative, 1),
        1 => reversed_frequency_major_index(packet_offset, total, beamlet, base, cumulative, 1),
        _ => time_major_index::<FACTOR>(beamlet, base, cumulative, packets_per_iteration, packet_offset),
    }
}

/// Advance per output time step: one full beamlet row in the frequency-major
/// orders, one element in time-major order.
#[inline(always)]
pub(crate) fn stokes_time_offset<const ORDER: u8>(beamlet_base: usize, ts: usize, total: usize) -> usize {
    if ORDER < 2 {
        beamlet_base + total * ts
    } else {
        beamlet_base + ts
    }
}

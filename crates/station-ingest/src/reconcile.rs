//! Per-port sequence reconciliation.
//!
//! Walks one iteration window of packets, keeping the accepted stream of
//! logical packet numbers strictly consecutive. Gaps are padded from the
//! zero prefix (or by replaying the previous good packet), late arrivals are
//! either folded into the slot they belong to (window incorporation) or
//! dropped, and malformed headers are skipped and surface as drops. The
//! kernel resolved at setup runs once per emitted slot, so the window walk
//! and the transform share one pass over the data.
//!
//! Counter convention follows the packet-loss bookkeeping of the wire
//! protocol: a pad increments the drop tally, a late arrival decrements it
//! (the slot it displaced was already counted), so the tally equals the net
//! number of missing packets.

use crate::buffers::{InputRing, SharedOut};
use crate::kernels::{KernelFn, PortShape};
use crate::packet::{self, HDR_LEN, N_TIMESLICE, PAD_MARKER};
use crate::unpack;

/// Everything fixed for a port across one iteration.
pub(crate) struct ReconcileParams<'a> {
    pub port: usize,
    /// Pad from the previous good packet instead of zeros.
    pub replay: bool,
    /// Fold late in-window arrivals into their already-padded slot.
    pub incorporate: bool,
    /// Raw packet-copy layout: synthesise plausible headers for pads.
    pub raw_headers: bool,
    /// Hand the kernel the header as well as the payload.
    pub include_header: bool,
    /// Expand 4-bit nibbles into `scratch` before the kernel runs.
    pub unpack: bool,
    pub kernel: KernelFn,
    pub shape: &'a PortShape,
    pub jones: &'a [f32],
}

/// Tallies for one reconciled window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ReconcileOutcome {
    /// Net missing packets (pads minus absorbed late arrivals).
    pub dropped: i64,
    /// Late arrivals seen.
    pub out_of_order: i64,
    /// Headers that failed sanity checks.
    pub malformed: i64,
    /// Pads emitted after the input window ran dry.
    pub exhausted_pads: i64,
    /// Packets consumed from the window.
    pub consumed: usize,
    /// Logical number of the last emitted slot.
    pub last_packet: i64,
    /// Window byte offset of the last accepted packet, for replay stashing;
    /// negative when the whole window was padded.
    pub last_accepted_off: isize,
}

/// Decode the next acceptable header at or after `*i_work`, skipping
/// malformed packets.
fn decode_from(
    ring: &InputRing,
    i_work: &mut usize,
    avail: usize,
    malformed: &mut i64,
    port: usize,
) -> Option<i64> {
    while *i_work < avail {
        match packet::packet_number(ring.packet(*i_work)) {
            Ok(n) => return Some(n),
            Err(err) => {
                tracing::debug!(port, packet = *i_work, %err, "skipping malformed packet");
                *malformed += 1;
                *i_work += 1;
            }
        }
    }
    None
}

fn run_kernel(
    params: &ReconcileParams<'_>,
    ring: &InputRing,
    scratch: &mut [u8],
    iloop: usize,
    src_off: isize,
    out: &SharedOut<'_>,
) {
    let pkt = ring.resolve(src_off);
    if params.unpack {
        unpack::expand(&pkt[HDR_LEN..], scratch);
        (params.kernel)(params.shape, iloop, scratch, params.jones, out);
    } else if params.include_header {
        (params.kernel)(params.shape, iloop, pkt, params.jones, out);
    } else {
        (params.kernel)(params.shape, iloop, &pkt[HDR_LEN..], params.jones, out);
    }
}

/// Reconcile and transform one window of `window_packets` slots starting at
/// logical packet `first_expected`.
pub(crate) fn reconcile_port(
    ring: &mut InputRing,
    first_expected: i64,
    window_packets: usize,
    params: &ReconcileParams<'_>,
    scratch: &mut [u8],
    out: &SharedOut<'_>,
) -> ReconcileOutcome {
    let plen = ring.packet_len() as isize;
    let avail = ring.filled();

    let mut outcome = ReconcileOutcome::default();
    let mut last_packet = first_expected - 1;
    let mut i_work: usize = 0;

    // Pad source before anything was accepted: the replay slot when
    // replaying, else the zero region.
    let mut last_off: isize = if params.replay { -plen } else { -2 * plen };

    let mut cur = decode_from(ring, &mut i_work, avail, &mut outcome.malformed, params.port);

    let mut iloop: usize = 0;
    while iloop < window_packets {
        match cur {
            Some(n) if n == last_packet + 1 => {
                // The expected packet.
                last_packet = n;
                let src_off = (i_work as isize) * plen;
                last_off = src_off;
                i_work += 1;

                cur = if i_work < avail {
                    // Fast path: sequence advances by 16 between packets, so
                    // compare before paying for a full decode. Misses at the
                    // seconds rollover and falls back.
                    let want = packet::raw_sequence(ring.resolve(src_off)).wrapping_add(N_TIMESLICE as u32);
                    if packet::raw_sequence(ring.packet(i_work)) == want {
                        Some(n + 1)
                    } else {
                        decode_from(ring, &mut i_work, avail, &mut outcome.malformed, params.port)
                    }
                } else {
                    None
                };

                run_kernel(params, ring, scratch, iloop, src_off, out);
            }
            Some(n) if n <= last_packet => {
                // Late arrival. Its slot was already padded (this window or a
                // previous one), so the pad tally comes back down either way.
                outcome.out_of_order += 1;
                outcome.dropped -= 1;

                let slot = n - first_expected;
                if params.incorporate && slot >= 0 {
                    run_kernel(params, ring, scratch, slot as usize, (i_work as isize) * plen, out);
                } else {
                    tracing::debug!(
                        port = params.port,
                        packet = n,
                        "dropping out-of-order packet"
                    );
                }

                i_work += 1;
                cur = decode_from(ring, &mut i_work, avail, &mut outcome.malformed, params.port);
                continue;
            }
            _ => {
                // Gap (or exhausted window): synthesise the missing slot.
                outcome.dropped += 1;
                last_packet += 1;
                if cur.is_none() {
                    outcome.exhausted_pads += 1;
                }

                let src_off = if params.replay { last_off } else { -2 * plen };
                if params.raw_headers {
                    let sequence = packet::sequence_for_packet(ring.resolve(last_off), last_packet);
                    ring.patch_pad_header(last_off, src_off, sequence, PAD_MARKER);
                }

                run_kernel(params, ring, scratch, iloop, src_off, out);
            }
        }
        iloop += 1;
    }

    // Absorb this window's stragglers still queued at the tail, so they do
    // not resurface as stale packets next iteration.
    while let Some(n) = cur {
        if n > last_packet {
            break;
        }
        outcome.out_of_order += 1;
        outcome.dropped -= 1;
        let slot = n - first_expected;
        if params.incorporate && slot >= 0 {
            run_kernel(params, ring, scratch, slot as usize, (i_work as isize) * plen, out);
        } else {
            tracing::debug!(port = params.port, packet = n, "dropping out-of-order packet");
        }
        i_work += 1;
        cur = decode_from(ring, &mut i_work, avail, &mut outcome.malformed, params.port);
    }

    outcome.consumed = i_work;
    outcome.last_packet = last_packet;
    outcome.last_accepted_off = last_off;
    outcome
}

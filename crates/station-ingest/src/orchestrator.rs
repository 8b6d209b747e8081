//! Observation orchestrator.
//!
//! Owns the per-port input rings and the output blocks, and drives the
//! iteration cycle: fill every ring, reconcile and transform each port on its
//! own worker, advance calibration on its cadence, and hand the finished
//! blocks to the writer thread. The scoped-thread join is the iteration
//! barrier: output is published only after every port completes with no
//! unresolved reordering, and per-port counters are merged after it.
//!
//! Writer hand-off is double-buffered through a bounded channel: the writer
//! thread holds the published blocks while the workers fill the recycled
//! ones, and back-pressure lands on the publish call, never inside a kernel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use serde::Serialize;

use crate::buffers::{BlockBuf, InputRing, SharedOut};
use crate::calibration::{CalibrationClock, CalibrationPipe, JONES_LEN};
use crate::config::ObservationConfig;
use crate::errors::{IngestError, Result};
use crate::io::{self, IoSpec, PortReader, StreamWriter};
use crate::kernels::{self, KernelPlan, Layout, PortShape};
use crate::metadata::{MetadataFormat, ObservationInfo};
use crate::packet::{self, BitMode, PacketHeader, HDR_LEN, N_TIMESLICE};
use crate::reconcile::{reconcile_port, ReconcileOutcome, ReconcileParams};

/// Extra window slack held back for the out-of-order retry pass.
fn window_slack(packets_per_iteration: usize) -> usize {
    (packets_per_iteration / 4).max(1)
}

// ---------------------------------------------------------------------------
// Per-port state
// ---------------------------------------------------------------------------

/// Cumulative packet-quality counters for one port.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PortStats {
    pub packets: i64,
    pub dropped: i64,
    pub out_of_order: i64,
    pub malformed: i64,
}

impl PortStats {
    fn absorb(&mut self, outcome: &ReconcileOutcome, window: usize) {
        self.packets += window as i64;
        self.dropped += outcome.dropped;
        self.out_of_order += outcome.out_of_order;
        self.malformed += outcome.malformed;
    }

    pub fn loss_fraction(&self) -> f64 {
        if self.packets == 0 {
            0.0
        } else {
            self.dropped.max(0) as f64 / self.packets as f64
        }
    }
}

struct PortCtx {
    reader: Box<dyn PortReader>,
    ring: InputRing,
    shape: PortShape,
    scratch: Vec<u8>,
    packet_len: usize,
    /// Logical number the next window starts at.
    next_expected: i64,
    stats: PortStats,
    eof: bool,
    /// Bytes consumed from the transport, for error context.
    byte_offset: u64,
}

impl PortCtx {
    /// Top the ring up to `want` packets; short fills latch EOF.
    fn fill(&mut self, want: usize) -> Result<()> {
        let port = self.shape.port_stream;
        if want > self.ring.capacity() {
            return Err(IngestError::BufferExhausted(port));
        }
        if self.eof || self.ring.filled() >= want {
            return Ok(());
        }
        let missing = want - self.ring.filled();
        let region = self.ring.fill_region(want);
        let got = io::read_fully(self.reader.as_mut(), region).map_err(|e| {
            IngestError::io(format!("port {port} at byte {}", self.byte_offset), e)
        })?;
        let whole = got / self.packet_len;
        if whole < missing {
            self.eof = true;
            if got % self.packet_len != 0 {
                tracing::warn!(
                    port,
                    trailing = got % self.packet_len,
                    "discarding trailing partial packet"
                );
            }
        }
        self.ring.note_filled(whole);
        self.byte_offset += got as u64;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Writer thread
// ---------------------------------------------------------------------------

struct WriteJob {
    stream: usize,
    iter: usize,
    first_packet: i64,
    bytes: Vec<u8>,
}

struct WriterHub {
    tx: Option<Sender<WriteJob>>,
    recycle: Receiver<Vec<u8>>,
    failed: Arc<AtomicBool>,
    handle: Option<JoinHandle<(Vec<u64>, Option<IngestError>)>>,
}

impl WriterHub {
    fn spawn(
        spec: IoSpec,
        writers: Vec<Box<dyn StreamWriter>>,
        metadata: Option<Vec<u8>>,
        streams: usize,
    ) -> Result<Self> {
        let (tx, rx) = bounded::<WriteJob>(streams * 2);
        let (recycle_tx, recycle) = unbounded::<Vec<u8>>();
        let failed = Arc::new(AtomicBool::new(false));
        let failed_flag = failed.clone();

        let handle = std::thread::Builder::new()
            .name("output-writer".into())
            .spawn(move || writer_loop(spec, writers, metadata, rx, recycle_tx, failed_flag))
            .map_err(|e| IngestError::AllocationFailed {
                what: "writer thread",
                detail: e.to_string(),
            })?;

        Ok(Self { tx: Some(tx), recycle, failed, handle: Some(handle) })
    }

    fn failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    fn publish(&self, job: WriteJob) {
        if let Some(tx) = &self.tx {
            // back-pressure: blocks while the writer still leases both sets
            let _ = tx.send(job);
        }
    }

    fn reclaim(&self, spare: &mut Vec<Vec<u8>>) {
        while let Ok(buf) = self.recycle.try_recv() {
            spare.push(buf);
        }
    }

    fn join(mut self) -> (Vec<u64>, Option<IngestError>) {
        self.tx = None;
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                (Vec::new(), Some(IngestError::io("writer thread", std::io::Error::other("panicked"))))
            }),
            None => (Vec::new(), None),
        }
    }
}

fn writer_loop(
    spec: IoSpec,
    mut writers: Vec<Box<dyn StreamWriter>>,
    metadata: Option<Vec<u8>>,
    rx: Receiver<WriteJob>,
    recycle: Sender<Vec<u8>>,
    failed: Arc<AtomicBool>,
) -> (Vec<u64>, Option<IngestError>) {
    let streams = writers.len();
    let mut bytes = vec![0u64; streams];
    let mut stream_iter = vec![0usize; streams];
    let mut error: Option<IngestError> = None;
    let rotating = spec.rotates();

    // sidecar headers lead every fresh target
    if let Some(block) = &metadata {
        for (stream, writer) in writers.iter_mut().enumerate() {
            if let Err(e) = writer.write_all(block) {
                report_write_error(&mut error, &failed, stream, e);
                break;
            }
            bytes[stream] += block.len() as u64;
        }
    }

    for job in rx.iter() {
        if error.is_none() {
            if rotating && job.iter != stream_iter[job.stream] {
                // rotate this stream onto the next target
                let finished = std::mem::replace(
                    &mut writers[job.stream],
                    match reopen(&spec, job.stream, job.iter, job.first_packet, &metadata, &mut bytes) {
                        Ok(w) => w,
                        Err(e) => {
                            error = Some(e);
                            failed.store(true, Ordering::Relaxed);
                            let _ = recycle.send(job.bytes);
                            continue;
                        }
                    },
                );
                if let Err(e) = finished.finish() {
                    report_write_error(&mut error, &failed, job.stream, e);
                }
                stream_iter[job.stream] = job.iter;
            }
            if error.is_none() {
                match writers[job.stream].write_all(&job.bytes) {
                    Ok(()) => bytes[job.stream] += job.bytes.len() as u64,
                    Err(e) => report_write_error(&mut error, &failed, job.stream, e),
                }
            }
        }
        let mut buf = job.bytes;
        buf.clear();
        let _ = recycle.send(buf);
    }

    for (stream, writer) in writers.into_iter().enumerate() {
        if let Err(e) = writer.finish() {
            report_write_error(&mut error, &failed, stream, e);
        }
    }
    (bytes, error)
}

fn reopen(
    spec: &IoSpec,
    stream: usize,
    iter: usize,
    first_packet: i64,
    metadata: &Option<Vec<u8>>,
    bytes: &mut [u64],
) -> Result<Box<dyn StreamWriter>> {
    let mut writer = io::open_writer(spec, stream, iter, first_packet)?;
    if let Some(block) = metadata {
        writer
            .write_all(block)
            .map_err(|e| IngestError::io(format!("stream {stream} metadata"), e))?;
        bytes[stream] += block.len() as u64;
    }
    Ok(writer)
}

fn report_write_error(
    error: &mut Option<IngestError>,
    failed: &AtomicBool,
    stream: usize,
    e: std::io::Error,
) {
    if error.is_some() {
        return;
    }
    if e.kind() == std::io::ErrorKind::BrokenPipe {
        // downstream went away: flush what we have and stop cleanly
        tracing::warn!(stream, "output pipe closed, shutting down");
    } else {
        tracing::error!(stream, %e, "output write failed");
    }
    *error = Some(IngestError::io(format!("stream {stream}"), e));
    failed.store(true, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Calibration state
// ---------------------------------------------------------------------------

struct CalState {
    pipe: CalibrationPipe,
    clock: CalibrationClock,
    matrices: Vec<f32>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// What one `step` produced.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// Packets emitted per port this iteration (zero at EOF).
    pub packets: i64,
    /// Net drops across ports this iteration.
    pub dropped: i64,
    /// No further iterations will produce data.
    pub eof: bool,
    /// An out-of-order burst exceeded what the retry pass could absorb.
    pub reordering_warning: bool,
}

/// End-of-observation accounting.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub packets_processed: i64,
    pub ports: Vec<PortStats>,
    pub bytes_written: Vec<u64>,
}

impl Summary {
    /// Largest per-port loss fraction, for the exit-code policy.
    pub fn worst_loss_fraction(&self) -> f64 {
        self.ports.iter().map(PortStats::loss_fraction).fold(0.0, f64::max)
    }
}

pub struct Orchestrator {
    layout: Layout,
    plan: KernelPlan,
    bit_mode: BitMode,
    clock_200mhz: bool,
    station_id: u16,
    ports: Vec<PortCtx>,
    packets_per_iteration: usize,
    out_bufs: Vec<BlockBuf>,
    /// Bytes per packet per stream (differs per stream only for raw copies).
    stream_packet_len: Vec<usize>,
    writer: WriterHub,
    spare_bufs: Vec<Vec<u8>>,
    calibration: Option<CalState>,
    replay: bool,
    incorporate: bool,
    packets_limit: Option<i64>,
    packets_done: i64,
    iteration: usize,
    /// Logical number of the next iteration's first packet.
    next_packet: i64,
    finished: bool,
}

impl Orchestrator {
    /// Allocate buffers, align all ports to the shared start packet, open the
    /// output streams and prime calibration.
    pub fn setup(config: &ObservationConfig) -> Result<Self> {
        let layout = config.validate()?;
        if layout.is_raw() && config.beamlet_limits.is_some() {
            return Err(IngestError::Usage(
                "raw packet copies cannot apply a beamlet range".into(),
            ));
        }

        let input_spec = IoSpec::parse(&config.input)?;
        let output_spec = IoSpec::parse(&config.output)?;
        let ppi = config.packets_per_iteration as usize;
        let capacity = ppi + window_slack(ppi);

        // Open every port and pull its first packet to learn the geometry.
        let mut ports = Vec::with_capacity(config.num_ports);
        let mut headers: Vec<PacketHeader> = Vec::with_capacity(config.num_ports);
        for port in 0..config.num_ports {
            let mut reader = io::open_reader(&input_spec, port, 0)?;
            let mut hdr_bytes = [0u8; HDR_LEN];
            let got = io::read_fully(reader.as_mut(), &mut hdr_bytes)
                .map_err(|e| IngestError::io(format!("port {port} at byte 0"), e))?;
            if got < HDR_LEN {
                return Err(IngestError::io(
                    format!("port {port}"),
                    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "no packets in stream"),
                ));
            }
            let header = PacketHeader::parse(&hdr_bytes)?;
            let packet_len = header.packet_len();

            let mut ring = InputRing::new(packet_len, capacity);
            let region = ring.fill_region(1);
            region[..HDR_LEN].copy_from_slice(&hdr_bytes);
            let got = io::read_fully(reader.as_mut(), &mut region[HDR_LEN..])
                .map_err(|e| IngestError::io(format!("port {port} at byte {HDR_LEN}"), e))?;
            if got < packet_len - HDR_LEN {
                return Err(IngestError::io(
                    format!("port {port}"),
                    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated first packet"),
                ));
            }
            ring.note_filled(1);

            headers.push(header);
            ports.push(PortCtx {
                reader,
                ring,
                shape: PortShape {
                    base_beamlet: 0,
                    upper_beamlet: 0,
                    cumulative_beamlets: 0,
                    total_beamlets: 0,
                    packets_per_iteration: ppi,
                    packet_output_len: 0,
                    port_stream: port,
                },
                scratch: vec![0u8; 2 * (packet_len - HDR_LEN)],
                packet_len,
                next_expected: 0,
                stats: PortStats::default(),
                eof: false,
                byte_offset: packet_len as u64,
            });
        }

        // All ports must share a clock and sample width.
        let bit_mode = headers[0].bit_mode;
        let clock_200mhz = headers[0].clock_200mhz;
        for (port, header) in headers.iter().enumerate() {
            if header.bit_mode != bit_mode || header.clock_200mhz != clock_200mhz {
                return Err(IngestError::Usage(format!(
                    "port {port} disagrees on bit mode or clock with port 0"
                )));
            }
        }

        // Beamlet selection across the merged axis.
        let raw_counts: Vec<usize> = headers.iter().map(|h| h.beamlets as usize).collect();
        let total_raw: usize = raw_counts.iter().sum();
        let (sel_low, sel_high) = match config.beamlet_limits {
            Some((low, high)) => (low as usize, (high as usize).min(total_raw)),
            None => (0, total_raw),
        };
        if sel_low >= sel_high {
            return Err(IngestError::Usage(format!(
                "beamlet range {sel_low}..{sel_high} selects nothing (streams carry {total_raw})"
            )));
        }
        let total_selected = sel_high - sel_low;

        let mut raw_cumulative = 0usize;
        let mut selected_cumulative = 0usize;
        for (port, ctx) in ports.iter_mut().enumerate() {
            let span = (raw_cumulative, raw_cumulative + raw_counts[port]);
            let lo = sel_low.max(span.0);
            let hi = sel_high.min(span.1);
            if lo >= hi {
                return Err(IngestError::Usage(format!(
                    "beamlet range {sel_low}..{sel_high} leaves port {port} empty"
                )));
            }
            ctx.shape.base_beamlet = lo - span.0;
            ctx.shape.upper_beamlet = hi - span.0;
            ctx.shape.cumulative_beamlets = selected_cumulative;
            ctx.shape.total_beamlets = total_selected;
            selected_cumulative += hi - lo;
            raw_cumulative = span.1;
        }

        let plan = kernels::resolve(layout, bit_mode, config.calibrate)?;
        for ctx in ports.iter_mut() {
            ctx.shape.packet_output_len = layout.packet_output_len(
                bit_mode,
                config.calibrate,
                total_selected,
                ctx.packet_len,
            );
        }

        // Align every port to the latest first packet (and the requested
        // start time); fail if a port cannot reach it.
        let mut shared_start = 0i64;
        for ctx in ports.iter() {
            shared_start = shared_start.max(packet::packet_number(ctx.ring.packet(0))?);
        }
        if let Some(t) = config.start_time {
            shared_start = shared_start.max(packet::packet_for_unix_time(t, clock_200mhz));
        }
        for ctx in ports.iter_mut() {
            align_port(ctx, shared_start)?;
        }

        // Output geometry and buffers.
        let streams = layout.output_streams(config.num_ports);
        let stream_packet_len: Vec<usize> = (0..streams)
            .map(|s| {
                if layout.is_raw() {
                    ports[s].shape.packet_output_len
                } else {
                    ports[0].shape.packet_output_len
                }
            })
            .collect();
        let out_kind = plan.out_kind;
        let out_bufs: Vec<BlockBuf> = stream_packet_len
            .iter()
            .map(|len| BlockBuf::alloc(out_kind, ppi * len / out_kind.bytes()))
            .collect();

        // Sidecar metadata, rendered once and replayed on every fresh target.
        let metadata_block = match &config.metadata {
            Some(name) => {
                let format = MetadataFormat::parse(name)?;
                let decimation = match layout {
                    Layout::Stokes { decimation, .. } => decimation,
                    _ => 1,
                };
                let info = ObservationInfo {
                    station_id: headers[0].station_id,
                    mode: config.mode,
                    channels: total_selected,
                    output_bits: out_kind.bits(),
                    sample_time: decimation as f64 / packet::ticks_per_second(clock_200mhz),
                    start_unix: shared_start as f64 * 16.0 / packet::ticks_per_second(clock_200mhz),
                    source_name: config
                        .source_name
                        .clone()
                        .unwrap_or_else(|| "J0000+0000".to_string()),
                };
                Some(crate::metadata::render(format, &info))
            }
            None => None,
        };

        // Open iteration-0 writers eagerly so target problems fail setup.
        let writers: Vec<Box<dyn StreamWriter>> = (0..streams)
            .map(|s| io::open_writer(&output_spec, s, 0, shared_start))
            .collect::<Result<_>>()?;
        let writer = WriterHub::spawn(output_spec, writers, metadata_block, streams)?;

        // Prime the calibration cache with the producer's first step.
        let calibration = if config.calibrate {
            let path = config.calibration_pipe.as_ref().expect("validated");
            let mut pipe = CalibrationPipe::open(path, total_selected)?;
            let clock = CalibrationClock::new(config.calibration_cadence, clock_200mhz)?;
            let mut matrices = Vec::with_capacity(total_selected * JONES_LEN);
            pipe.next_step(&mut matrices)?;
            Some(CalState { pipe, clock, matrices })
        } else {
            None
        };

        let packets_limit = config
            .duration
            .map(|d| packet::packets_for_duration(d, clock_200mhz));

        tracing::info!(
            ports = config.num_ports,
            mode = config.mode,
            beamlets = total_selected,
            start_packet = shared_start,
            packets_per_iteration = ppi,
            "observation aligned"
        );

        Ok(Self {
            layout,
            plan,
            bit_mode,
            clock_200mhz,
            station_id: headers[0].station_id,
            ports,
            packets_per_iteration: ppi,
            out_bufs,
            stream_packet_len,
            writer,
            spare_bufs: Vec::new(),
            calibration,
            replay: config.replay_dropped,
            incorporate: config.incorporate_reordered,
            packets_limit,
            packets_done: 0,
            iteration: 0,
            next_packet: shared_start,
            finished: false,
        })
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn bit_mode(&self) -> BitMode {
        self.bit_mode
    }

    pub fn clock_200mhz(&self) -> bool {
        self.clock_200mhz
    }

    pub fn station_id(&self) -> u16 {
        self.station_id
    }

    pub fn port_stats(&self) -> Vec<PortStats> {
        self.ports.iter().map(|p| p.stats.clone()).collect()
    }

    /// Run one iteration: fill, reconcile in parallel, transform, publish.
    pub fn step(&mut self) -> Result<StepResult> {
        if self.finished {
            return Ok(StepResult { packets: 0, dropped: 0, eof: true, reordering_warning: false });
        }
        if self.writer.failed() {
            self.finished = true;
            return Ok(StepResult { packets: 0, dropped: 0, eof: true, reordering_warning: false });
        }

        let mut window = self.packets_per_iteration;
        if let Some(limit) = self.packets_limit {
            let remaining = (limit - self.packets_done).max(0) as usize;
            window = window.min(remaining);
        }
        if window == 0 {
            self.finished = true;
            return Ok(StepResult { packets: 0, dropped: 0, eof: true, reordering_warning: false });
        }

        for ctx in self.ports.iter_mut() {
            ctx.fill(window)?;
        }
        let effective: usize = self
            .ports
            .iter()
            .map(|c| c.ring.filled().min(window))
            .min()
            .unwrap_or(0);
        if effective == 0 {
            self.finished = true;
            return Ok(StepResult { packets: 0, dropped: 0, eof: true, reordering_warning: false });
        }
        let window = effective;

        // Bring the Jones cache up to the step this window starts in.
        if let Some(cal) = self.calibration.as_mut() {
            while u64::from(cal.pipe.steps_read()) <= cal.clock.current_step() {
                cal.pipe.next_step(&mut cal.matrices)?;
            }
        }

        // First reconcile pass, and one retry with an extended window when a
        // reordering burst starved the tail.
        let mut outcomes = self.run_port_workers(window);
        let starved = outcomes
            .iter()
            .any(|o| o.exhausted_pads > 0 && o.out_of_order > 0);
        let mut reordering_warning = false;
        if starved {
            let extra: usize = outcomes.iter().map(|o| o.out_of_order.max(0) as usize).max().unwrap_or(0);
            let target = (window + extra).min(window + window_slack(self.packets_per_iteration));
            tracing::warn!(extra, "reordering starved the window, retrying with extended input");
            for ctx in self.ports.iter_mut() {
                ctx.fill(target)?;
            }
            outcomes = self.run_port_workers(window);
            if outcomes.iter().any(|o| o.exhausted_pads > 0 && o.out_of_order > 0) {
                reordering_warning = true;
            }
        }

        // Merge counters and retire consumed input after the barrier.
        let mut dropped = 0i64;
        for (ctx, outcome) in self.ports.iter_mut().zip(outcomes.iter()) {
            if outcome.out_of_order > (window as i64) / 5 {
                let warn = IngestError::ReorderingExceeded {
                    port: ctx.shape.port_stream,
                    reordered: outcome.out_of_order,
                    window: window as i64,
                };
                tracing::warn!(%warn, "excessive packet reordering");
                reordering_warning = true;
            }
            if outcome.last_accepted_off >= 0 {
                ctx.ring.stash_replay(outcome.last_accepted_off);
            }
            ctx.ring.retire(outcome.consumed);
            ctx.next_expected = outcome.last_packet + 1;
            ctx.stats.absorb(outcome, window);
            dropped += outcome.dropped;
        }

        self.publish(window);

        if let Some(cal) = self.calibration.as_mut() {
            cal.clock.advance((window * N_TIMESLICE) as u64);
        }

        self.packets_done += window as i64;
        self.next_packet += window as i64;
        self.iteration += 1;

        Ok(StepResult { packets: window as i64, dropped, eof: false, reordering_warning })
    }

    /// One worker per port; the join is the iteration barrier.
    fn run_port_workers(&mut self, window: usize) -> Vec<ReconcileOutcome> {
        let plan = self.plan;
        let replay = self.replay;
        let incorporate = self.incorporate;
        let jones_all: &[f32] = match &self.calibration {
            Some(cal) => &cal.matrices,
            None => &[],
        };
        let ports = &mut self.ports;
        let out_bufs = &mut self.out_bufs;

        for ctx in ports.iter_mut() {
            ctx.shape.packets_per_iteration = window;
        }

        let out = SharedOut::new(out_bufs);
        std::thread::scope(|scope| {
            let out = &out;
            let handles: Vec<_> = ports
                .iter_mut()
                .map(|ctx| {
                    let selected = ctx.shape.upper_beamlet - ctx.shape.base_beamlet;
                    let jones = if jones_all.is_empty() {
                        jones_all
                    } else {
                        let start = ctx.shape.cumulative_beamlets * JONES_LEN;
                        &jones_all[start..start + selected * JONES_LEN]
                    };
                    scope.spawn(move || {
                        let params = ReconcileParams {
                            port: ctx.shape.port_stream,
                            replay,
                            incorporate,
                            raw_headers: plan.include_header,
                            include_header: plan.include_header,
                            unpack: plan.unpack,
                            kernel: plan.kernel,
                            shape: &ctx.shape,
                            jones,
                        };
                        reconcile_port(
                            &mut ctx.ring,
                            ctx.next_expected,
                            window,
                            &params,
                            &mut ctx.scratch,
                            out,
                        )
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("port worker panicked"))
                .collect()
        })
    }

    /// Hand the iteration's output to the writer thread.
    fn publish(&mut self, window: usize) {
        self.writer.reclaim(&mut self.spare_bufs);
        for (stream, buf) in self.out_bufs.iter().enumerate() {
            let elems = window * self.stream_packet_len[stream] / buf.kind().bytes();
            let mut bytes = self.spare_bufs.pop().unwrap_or_default();
            bytes.clear();
            buf.le_bytes_into(elems, &mut bytes);
            self.writer.publish(WriteJob {
                stream,
                iter: self.iteration,
                first_packet: self.next_packet,
                bytes,
            });
        }
    }

    /// Flush the writers and emit the observation summary.
    pub fn teardown(self) -> Result<Summary> {
        let packets = self.packets_done;
        let ports: Vec<PortStats> = self.ports.iter().map(|p| p.stats.clone()).collect();
        let (bytes_written, error) = self.writer.join();

        for (port, stats) in ports.iter().enumerate() {
            tracing::info!(
                port,
                packets = stats.packets,
                dropped = stats.dropped,
                out_of_order = stats.out_of_order,
                malformed = stats.malformed,
                "port summary"
            );
        }
        for (stream, bytes) in bytes_written.iter().enumerate() {
            tracing::info!(stream, bytes, "stream summary");
        }

        if let Some(err) = error {
            // broken pipes already stopped the run cleanly; anything else is
            // a transport failure worth surfacing
            if !matches!(
                &err,
                IngestError::IoFailure { source, .. }
                    if source.kind() == std::io::ErrorKind::BrokenPipe
            ) {
                return Err(err);
            }
        }

        Ok(Summary { packets_processed: packets, ports, bytes_written })
    }
}

/// Discard packets until `ctx`'s stream reaches `target`; EOF first is fatal.
fn align_port(ctx: &mut PortCtx, target: i64) -> Result<()> {
    loop {
        ctx.fill(1)?;
        if ctx.ring.filled() == 0 {
            return Err(IngestError::io(
                format!("port {}", ctx.shape.port_stream),
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("stream ends before shared start packet {target}"),
                ),
            ));
        }
        match packet::packet_number(ctx.ring.packet(0)) {
            Ok(n) if n >= target => {
                ctx.next_expected = target;
                return Ok(());
            }
            Ok(_) => ctx.ring.retire(1),
            Err(_) => {
                ctx.stats.malformed += 1;
                ctx.ring.retire(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_fraction() {
        let mut stats = PortStats::default();
        assert_eq!(stats.loss_fraction(), 0.0);
        stats.packets = 100;
        stats.dropped = 25;
        assert!((stats.loss_fraction() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_summary_worst_loss() {
        let summary = Summary {
            packets_processed: 200,
            ports: vec![
                PortStats { packets: 100, dropped: 5, ..Default::default() },
                PortStats { packets: 100, dropped: 30, ..Default::default() },
            ],
            bytes_written: vec![0],
        };
        assert!((summary.worst_loss_fraction() - 0.30).abs() < 1e-12);
    }

    #[test]
    fn test_window_slack_floor() {
        assert_eq!(window_slack(1), 1);
        assert_eq!(window_slack(64), 16);
    }
}

//! System V shared-memory ring transport.
//!
//! A keyed segment holds a 64-byte control header followed by a byte ring.
//! The writer appends and publishes `write_pos`; a single reader locks the
//! segment as its exclusive consumer, realigns to the derived packet
//! boundary, and drains up to a page-sized chunk per call. The writer sets
//! the end-of-data flag when it finishes; the reader reports EOF once the
//! ring is drained past it.
//!
//! Segment layout (offsets in bytes):
//!   0 ..  8  magic
//!   8 .. 16  ring capacity
//!  16 .. 24  write_pos, total bytes produced (atomic)
//!  24 .. 32  read_pos, total bytes consumed (atomic)
//!  32 .. 33  end-of-data flag (atomic)
//!  33 .. 34  reader lock (atomic)
//!  64 ..     data ring

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use super::{PortReader, StreamWriter};
use crate::errors::{IngestError, Result};

const MAGIC: u64 = 0x5354_4e52_494e_4731; // "STNRING1"
const HDR_SIZE: usize = 64;
/// Data bytes in the ring.
const RING_BYTES: usize = 8 * 1024 * 1024;
/// Upper bound on one read call, the ring's page size.
const PAGE_BYTES: usize = 256 * 1024;
/// Backoff while waiting on the peer.
const POLL: Duration = Duration::from_micros(200);

struct Segment {
    id: libc::c_int,
    base: *mut u8,
}

unsafe impl Send for Segment {}

impl Segment {
    fn create(key: i32) -> Result<Self> {
        let total = HDR_SIZE + RING_BYTES;
        let id = unsafe { libc::shmget(key, total, libc::IPC_CREAT | 0o666) };
        if id < 0 {
            return Err(IngestError::AllocationFailed {
                what: "shared-memory ring",
                detail: format!("shmget key {key}: {}", std::io::Error::last_os_error()),
            });
        }
        Self::attach_id(id)
    }

    fn open(key: i32) -> Result<Self> {
        let id = unsafe { libc::shmget(key, 0, 0) };
        if id < 0 {
            return Err(IngestError::io(
                format!("shared-memory ring key {key}"),
                std::io::Error::last_os_error(),
            ));
        }
        Self::attach_id(id)
    }

    fn attach_id(id: libc::c_int) -> Result<Self> {
        let base = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if base as isize == -1 {
            return Err(IngestError::AllocationFailed {
                what: "shared-memory mapping",
                detail: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(Self { id, base: base as *mut u8 })
    }

    fn word(&self, off: usize) -> &AtomicU64 {
        debug_assert!(off % 8 == 0 && off + 8 <= HDR_SIZE);
        unsafe { &*(self.base.add(off) as *const AtomicU64) }
    }

    fn byte(&self, off: usize) -> &AtomicU8 {
        debug_assert!(off < HDR_SIZE);
        unsafe { &*(self.base.add(off) as *const AtomicU8) }
    }

    fn magic(&self) -> &AtomicU64 {
        self.word(0)
    }
    fn capacity(&self) -> &AtomicU64 {
        self.word(8)
    }
    fn write_pos(&self) -> &AtomicU64 {
        self.word(16)
    }
    fn read_pos(&self) -> &AtomicU64 {
        self.word(24)
    }
    fn eod(&self) -> &AtomicU8 {
        self.byte(32)
    }
    fn reader_lock(&self) -> &AtomicU8 {
        self.byte(33)
    }

    fn data(&self, off: usize) -> *mut u8 {
        debug_assert!(off < RING_BYTES);
        unsafe { self.base.add(HDR_SIZE + off) }
    }

    fn detach(&self) {
        unsafe {
            libc::shmdt(self.base as *const libc::c_void);
        }
    }

    fn remove(&self) {
        unsafe {
            libc::shmctl(self.id, libc::IPC_RMID, std::ptr::null_mut());
        }
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

pub struct ShmWriter {
    seg: Segment,
    finished: bool,
}

impl ShmWriter {
    /// Create (or reuse) the ring at `base_key + stream`.
    pub fn create(base_key: i32, stream: usize) -> Result<Self> {
        let seg = Segment::create(base_key + stream as i32)?;
        if seg.magic().load(Ordering::Acquire) != MAGIC {
            seg.capacity().store(RING_BYTES as u64, Ordering::Relaxed);
            seg.write_pos().store(0, Ordering::Relaxed);
            seg.read_pos().store(0, Ordering::Relaxed);
            seg.eod().store(0, Ordering::Relaxed);
            seg.reader_lock().store(0, Ordering::Relaxed);
            seg.magic().store(MAGIC, Ordering::Release);
        }
        Ok(Self { seg, finished: false })
    }
}

impl StreamWriter for ShmWriter {
    fn write_all(&mut self, src: &[u8]) -> std::io::Result<()> {
        let cap = RING_BYTES as u64;
        let mut offset = 0usize;
        while offset < src.len() {
            let write = self.seg.write_pos().load(Ordering::Relaxed);
            let read = self.seg.read_pos().load(Ordering::Acquire);
            let space = (cap - (write - read)) as usize;
            if space == 0 {
                std::thread::sleep(POLL);
                continue;
            }
            let ring_off = (write % cap) as usize;
            let chunk = (src.len() - offset).min(space).min(RING_BYTES - ring_off);
            unsafe {
                std::ptr::copy_nonoverlapping(src[offset..].as_ptr(), self.seg.data(ring_off), chunk);
            }
            self.seg.write_pos().store(write + chunk as u64, Ordering::Release);
            offset += chunk;
        }
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> std::io::Result<()> {
        self.seg.eod().store(1, Ordering::Release);
        self.seg.detach();
        self.finished = true;
        Ok(())
    }
}

impl Drop for ShmWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.seg.eod().store(1, Ordering::Release);
            self.seg.detach();
        }
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

pub struct ShmReader {
    seg: Segment,
    next: u64,
    cap: u64,
}

impl ShmReader {
    /// Attach to the ring at `base_key + port` as its exclusive reader and
    /// realign to the packet boundary.
    pub fn attach(base_key: i32, port: usize, packet_len: usize) -> Result<Self> {
        let key = base_key + port as i32;
        let seg = Segment::open(key)?;
        if seg.magic().load(Ordering::Acquire) != MAGIC {
            seg.detach();
            return Err(IngestError::Usage(format!(
                "shared-memory segment {key} is not a station ring"
            )));
        }
        if seg
            .reader_lock()
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            seg.detach();
            return Err(IngestError::Usage(format!(
                "shared-memory ring {key} already has a reader"
            )));
        }
        let cap = seg.capacity().load(Ordering::Acquire);

        // Start at the oldest byte still in the ring, rounded up to the next
        // whole packet so a partially overwritten packet is never emitted.
        let write = seg.write_pos().load(Ordering::Acquire);
        let oldest = write.saturating_sub(cap);
        let plen = packet_len as u64;
        let next = if plen > 0 { oldest.div_ceil(plen) * plen } else { oldest };
        seg.read_pos().store(next, Ordering::Release);
        tracing::debug!(key, port, start = next, "attached to shared-memory ring");
        Ok(Self { seg, next, cap })
    }
}

impl PortReader for ShmReader {
    fn read_into(&mut self, dst: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let write = self.seg.write_pos().load(Ordering::Acquire);
            let avail = (write - self.next) as usize;
            if avail == 0 {
                if self.seg.eod().load(Ordering::Acquire) != 0 {
                    return Ok(0);
                }
                std::thread::sleep(POLL);
                continue;
            }
            let ring_off = (self.next % self.cap) as usize;
            let chunk =
                dst.len().min(avail).min(PAGE_BYTES).min(self.cap as usize - ring_off);
            unsafe {
                std::ptr::copy_nonoverlapping(self.seg.data(ring_off), dst.as_mut_ptr(), chunk);
            }
            self.next += chunk as u64;
            self.seg.read_pos().store(self.next, Ordering::Release);
            return Ok(chunk);
        }
    }
}

impl Drop for ShmReader {
    fn drop(&mut self) {
        // The exclusive reader owns cleanup; the segment disappears once the
        // writer detaches as well.
        self.seg.remove();
        self.seg.detach();
    }
}

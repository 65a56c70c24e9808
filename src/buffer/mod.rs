//! Packet buffer: variable-size message FIFO with reserve/commit semantics
//!
//! The buffer is the only synchronisation point between producer and
//! consumer stages. Writers reserve space with [`PacketWriter::set_size`],
//! fill it through [`PacketWriter::write`] or the zero-copy
//! [`PacketWriter::dma`] view, and publish atomically on
//! [`PacketWriter::close`]. Readers receive whole packets in commit order;
//! a packet's bytes stay accounted against the buffer until its reader is
//! dropped.
//!
//! Committed bytes are immutable, readers never observe a partial commit,
//! and cancelling a writer returns the reservation without leaving a trace.

use crate::error::{GlcastError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

struct Inner {
    /// Committed packets in close-call order
    queue: VecDeque<Vec<u8>>,
    /// Bytes reserved by open writers, committed in the queue, or held by
    /// open readers
    used: usize,
    cancelled: bool,
}

/// Shared-memory style packet FIFO
pub struct PacketBuffer {
    inner: Mutex<Inner>,
    /// Signalled when reservation space is returned
    space: Condvar,
    /// Signalled when a packet is committed
    data: Condvar,
    capacity: usize,
}

impl PacketBuffer {
    /// Create a buffer that accounts at most `capacity` payload bytes
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                used: 0,
                cancelled: false,
            }),
            space: Condvar::new(),
            data: Condvar::new(),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Open a blocking write handle; `set_size` waits for space
    pub fn open_write(self: &Arc<Self>) -> Result<PacketWriter> {
        self.open_writer(true)
    }

    /// Open a non-blocking write handle; `set_size` fails with `Busy`
    /// instead of waiting
    pub fn open_write_try(self: &Arc<Self>) -> Result<PacketWriter> {
        self.open_writer(false)
    }

    fn open_writer(self: &Arc<Self>, blocking: bool) -> Result<PacketWriter> {
        if self.inner.lock().cancelled {
            return Err(GlcastError::Cancelled);
        }
        Ok(PacketWriter {
            buffer: self.clone(),
            blocking,
            reserved: 0,
            written: 0,
            buf: Vec::new(),
            done: false,
        })
    }

    /// Pop the next committed packet, waiting until one is available
    pub fn open_read(self: &Arc<Self>) -> Result<PacketReader> {
        let mut inner = self.inner.lock();
        loop {
            if inner.cancelled {
                return Err(GlcastError::Cancelled);
            }
            if let Some(data) = inner.queue.pop_front() {
                return Ok(PacketReader {
                    buffer: self.clone(),
                    data,
                });
            }
            self.data.wait(&mut inner);
        }
    }

    /// Pop the next committed packet, failing with `Busy` when none is
    /// available
    pub fn open_read_try(self: &Arc<Self>) -> Result<PacketReader> {
        let mut inner = self.inner.lock();
        if inner.cancelled {
            return Err(GlcastError::Cancelled);
        }
        match inner.queue.pop_front() {
            Some(data) => Ok(PacketReader {
                buffer: self.clone(),
                data,
            }),
            None => Err(GlcastError::Busy),
        }
    }

    /// Cancel the buffer: wake every blocked handle and fail all
    /// operations until [`PacketBuffer::reopen`]
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        if !inner.cancelled {
            inner.cancelled = true;
            tracing::debug!("packet buffer cancelled");
        }
        drop(inner);
        self.space.notify_all();
        self.data.notify_all();
    }

    /// Clear the cancelled state; committed packets survive
    pub fn reopen(&self) {
        self.inner.lock().cancelled = false;
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    /// Number of committed packets waiting for a reader
    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }

    fn release(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.used -= bytes;
        drop(inner);
        self.space.notify_all();
    }
}

/// Process-wide cancellation flag
///
/// Any component can set it; every buffer registered against it is
/// cancelled at that moment, and all stages observe the flag at their next
/// suspension point and drain.
#[derive(Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: std::sync::atomic::AtomicBool,
    buffers: Mutex<Vec<Arc<PacketBuffer>>>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a buffer to be cancelled when the flag is set
    pub fn register(&self, buffer: &Arc<PacketBuffer>) {
        self.inner.buffers.lock().push(buffer.clone());
    }

    /// Set the flag and cancel every registered buffer
    pub fn set(&self) {
        self.inner
            .flag
            .store(true, std::sync::atomic::Ordering::SeqCst);
        for buffer in self.inner.buffers.lock().iter() {
            buffer.cancel();
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.flag.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Write handle over one packet reservation
///
/// Dropping the handle without closing cancels the packet.
pub struct PacketWriter {
    buffer: Arc<PacketBuffer>,
    blocking: bool,
    reserved: usize,
    written: usize,
    buf: Vec<u8>,
    done: bool,
}

impl PacketWriter {
    /// Declare the packet's payload length, reserving space in the buffer
    ///
    /// May be called again before any bytes are written to adjust the
    /// reservation. Blocking handles wait for space; try handles fail with
    /// `Busy`. A size above the buffer capacity fails with `NoSpace`.
    pub fn set_size(&mut self, size: usize) -> Result<()> {
        if size > self.buffer.capacity {
            return Err(GlcastError::NoSpace);
        }
        if size < self.written {
            return Err(GlcastError::InvalidArgument(
                "reservation below written bytes",
            ));
        }

        let mut inner = self.buffer.inner.lock();
        loop {
            if inner.cancelled {
                return Err(GlcastError::Cancelled);
            }
            let needed = size.saturating_sub(self.reserved);
            if inner.used + needed <= self.buffer.capacity {
                if size >= self.reserved {
                    inner.used += needed;
                } else {
                    inner.used -= self.reserved - size;
                }
                break;
            }
            if !self.blocking {
                return Err(GlcastError::Busy);
            }
            self.buffer.space.wait(&mut inner);
        }
        drop(inner);

        self.reserved = size;
        self.buf.resize(size, 0);
        Ok(())
    }

    /// Append bytes to the reservation
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.written + bytes.len() > self.reserved {
            return Err(GlcastError::InvalidArgument("write exceeds reservation"));
        }
        self.buf[self.written..self.written + bytes.len()].copy_from_slice(bytes);
        self.written += bytes.len();
        Ok(())
    }

    /// Exclusive view of the next `len` unwritten bytes for zero-copy fill
    ///
    /// The returned slice borrows the handle, so it cannot outlive the
    /// packet: closing or cancelling invalidates it.
    pub fn dma(&mut self, len: usize) -> Result<&mut [u8]> {
        if self.written + len > self.reserved {
            return Err(GlcastError::InvalidArgument("dma exceeds reservation"));
        }
        let start = self.written;
        self.written += len;
        Ok(&mut self.buf[start..start + len])
    }

    /// Commit the packet; readers observe it after every earlier close
    pub fn close(mut self) -> Result<()> {
        self.done = true;
        let data = std::mem::take(&mut self.buf);

        {
            let mut inner = self.buffer.inner.lock();
            if inner.cancelled {
                drop(inner);
                self.buffer.release(self.reserved);
                return Err(GlcastError::Cancelled);
            }
            inner.queue.push_back(data);
        }

        self.buffer.data.notify_one();
        Ok(())
    }

    /// Discard the packet without publishing it
    pub fn cancel(mut self) {
        self.done = true;
        self.buffer.release(self.reserved);
    }
}

impl Drop for PacketWriter {
    fn drop(&mut self) {
        if !self.done {
            self.buffer.release(self.reserved);
        }
    }
}

/// Read handle over one committed packet
///
/// The packet's bytes are returned to the buffer's space accounting when
/// the reader is dropped.
pub struct PacketReader {
    buffer: Arc<PacketBuffer>,
    data: Vec<u8>,
}

impl PacketReader {
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PacketReader {
    fn drop(&mut self) {
        self.buffer.release(self.data.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_write_read_round_trip() {
        let buffer = PacketBuffer::new(1024);

        let mut writer = buffer.open_write().unwrap();
        writer.set_size(5).unwrap();
        writer.write(&[1, 2, 3, 4, 5]).unwrap();
        writer.close().unwrap();

        let reader = buffer.open_read().unwrap();
        assert_eq!(reader.data(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_commit_order_is_close_order() {
        let buffer = PacketBuffer::new(1024);

        let mut a = buffer.open_write().unwrap();
        let mut b = buffer.open_write().unwrap();
        a.set_size(1).unwrap();
        b.set_size(1).unwrap();
        a.write(&[b'a']).unwrap();
        b.write(&[b'b']).unwrap();

        // b closes first despite a opening first
        b.close().unwrap();
        a.close().unwrap();

        assert_eq!(buffer.open_read().unwrap().data(), b"b");
        assert_eq!(buffer.open_read().unwrap().data(), b"a");
    }

    #[test]
    fn test_cancel_leaves_no_trace() {
        let buffer = PacketBuffer::new(64);

        let mut writer = buffer.open_write().unwrap();
        writer.set_size(64).unwrap();
        writer.write(&[0xff; 64]).unwrap();
        writer.cancel();

        // the full reservation is available again
        let mut writer = buffer.open_write_try().unwrap();
        writer.set_size(64).unwrap();
        writer.close().unwrap();
        assert_eq!(buffer.pending(), 1);
    }

    #[test]
    fn test_drop_without_close_cancels() {
        let buffer = PacketBuffer::new(32);
        {
            let mut writer = buffer.open_write().unwrap();
            writer.set_size(32).unwrap();
        }
        let mut writer = buffer.open_write_try().unwrap();
        assert!(writer.set_size(32).is_ok());
    }

    #[test]
    fn test_try_write_busy_when_full() {
        let buffer = PacketBuffer::new(16);

        let mut held = buffer.open_write().unwrap();
        held.set_size(16).unwrap();

        let mut writer = buffer.open_write_try().unwrap();
        assert!(matches!(writer.set_size(1), Err(GlcastError::Busy)));

        held.cancel();
        let mut writer = buffer.open_write_try().unwrap();
        assert!(writer.set_size(1).is_ok());
    }

    #[test]
    fn test_oversize_reservation_rejected() {
        let buffer = PacketBuffer::new(8);
        let mut writer = buffer.open_write().unwrap();
        assert!(matches!(writer.set_size(9), Err(GlcastError::NoSpace)));
    }

    #[test]
    fn test_try_read_busy_when_empty() {
        let buffer = PacketBuffer::new(8);
        assert!(matches!(
            buffer.open_read_try().map(|_| ()),
            Err(GlcastError::Busy)
        ));
    }

    #[test]
    fn test_reader_returns_space_on_drop() {
        let buffer = PacketBuffer::new(8);

        let mut writer = buffer.open_write().unwrap();
        writer.set_size(8).unwrap();
        writer.close().unwrap();

        let reader = buffer.open_read().unwrap();
        // committed bytes still occupy the buffer while the reader is open
        let mut writer = buffer.open_write_try().unwrap();
        assert!(matches!(writer.set_size(8), Err(GlcastError::Busy)));

        drop(reader);
        let mut writer = buffer.open_write_try().unwrap();
        assert!(writer.set_size(8).is_ok());
    }

    #[test]
    fn test_cancel_wakes_blocked_reader() {
        let buffer = PacketBuffer::new(8);
        let reader_buffer = buffer.clone();

        let handle = thread::spawn(move || reader_buffer.open_read().map(|_| ()));

        thread::sleep(Duration::from_millis(20));
        buffer.cancel();

        assert!(matches!(
            handle.join().unwrap(),
            Err(GlcastError::Cancelled)
        ));
    }

    #[test]
    fn test_reopen_restores_operation() {
        let buffer = PacketBuffer::new(8);
        buffer.cancel();
        assert!(buffer.open_write().is_err());

        buffer.reopen();
        let mut writer = buffer.open_write().unwrap();
        writer.set_size(4).unwrap();
        writer.close().unwrap();
        assert_eq!(buffer.pending(), 1);
    }

    #[test]
    fn test_concurrent_writers_total_order() {
        let buffer = PacketBuffer::new(1 << 16);
        let mut handles = Vec::new();

        for t in 0u8..4 {
            let buffer = buffer.clone();
            handles.push(thread::spawn(move || {
                for i in 0u8..32 {
                    let mut writer = buffer.open_write().unwrap();
                    writer.set_size(2).unwrap();
                    writer.write(&[t, i]).unwrap();
                    writer.close().unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // every packet is whole and per-writer sequence numbers ascend
        let mut last_seen = [None::<u8>; 4];
        for _ in 0..128 {
            let reader = buffer.open_read().unwrap();
            let data = reader.data();
            assert_eq!(data.len(), 2);
            let (t, i) = (data[0] as usize, data[1]);
            if let Some(prev) = last_seen[t] {
                assert!(i > prev);
            }
            last_seen[t] = Some(i);
        }
    }
}

//! Worker pool driving a processing stage between two packet buffers
//!
//! A [`ThreadRunner`] spawns N OS threads that consume messages from one
//! buffer and, for stages that produce output, write into another. Per
//! message a worker dispatches the stage's read phase, acts on the returned
//! [`ReadAction`], and for produced packets dispatches the write phase to
//! fill the reserved output region in place.
//!
//! Ordering across workers is not preserved: concurrent workers may commit
//! in an order different from their read order. A stage that needs
//! serialisation provides it itself (the scale stage's per-stream lock).

use crate::buffer::PacketBuffer;
use crate::error::{GlcastError, Result};
use crate::message::{MsgHeader, MSG_HEADER_SIZE};
use crossbeam_channel::bounded;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Disposition chosen by a stage's read phase for one message
pub enum ReadAction<J> {
    /// Forward the message verbatim (or just consume it when the runner
    /// has no output buffer)
    Copy,
    /// Replace the payload with the given bytes, keeping the message kind
    Rewrite(Vec<u8>),
    /// Reserve `size` output bytes and fill them in the write phase;
    /// `job` carries read-phase state into the write phase
    Produce { size: usize, job: J },
}

/// A processing stage hosted by a [`ThreadRunner`]
///
/// `Job` is per-message state pinned in [`Stage::read`] and handed to
/// [`Stage::write`] on the same worker thread, so stages can defer work
/// from the read phase to the write phase without touching shared maps
/// twice.
pub trait Stage: Send + Sync + 'static {
    type Job;

    /// Inspect one message and choose its disposition
    fn read(&self, header: &MsgHeader, payload: &[u8]) -> Result<ReadAction<Self::Job>>;

    /// Fill the reserved output region for a `Produce` disposition.
    /// `out` is exactly the reserved size, following the copied message
    /// header.
    fn write(
        &self,
        job: Self::Job,
        header: &MsgHeader,
        payload: &[u8],
        out: &mut [u8],
    ) -> Result<()> {
        let _ = (job, header, payload, out);
        Ok(())
    }

    /// Called exactly once when the pool drains, with the first fatal
    /// error if any worker hit one
    fn finish(&self, err: Option<&GlcastError>) {
        let _ = err;
    }
}

/// Handle over a running worker pool
pub struct ThreadRunner {
    workers: Vec<JoinHandle<()>>,
    supervisor: JoinHandle<Option<GlcastError>>,
}

impl ThreadRunner {
    /// Worker count matching the host's available parallelism
    pub fn default_threads() -> usize {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }

    /// Spawn `threads` workers running `stage` between `input` and
    /// `output`
    pub fn spawn<S: Stage>(
        stage: Arc<S>,
        threads: usize,
        input: Arc<PacketBuffer>,
        output: Option<Arc<PacketBuffer>>,
    ) -> Result<Self> {
        if threads == 0 {
            return Err(GlcastError::InvalidArgument("worker count must be nonzero"));
        }

        // each worker reports its outcome once; the channel never blocks
        let (done_tx, done_rx) = bounded::<Option<GlcastError>>(threads);

        let mut workers = Vec::with_capacity(threads);
        for _ in 0..threads {
            let stage = stage.clone();
            let input = input.clone();
            let output = output.clone();
            let done_tx = done_tx.clone();

            workers.push(thread::spawn(move || {
                let outcome = worker_loop(&*stage, &input, output.as_ref());

                let err = match outcome {
                    Ok(()) => None,
                    Err(err) => {
                        error!("stage worker failed: {err}");
                        input.cancel();
                        if let Some(out) = &output {
                            out.cancel();
                        }
                        Some(err)
                    }
                };
                let _ = done_tx.send(err);
            }));
        }
        drop(done_tx);

        // the supervisor fires the finish callback once the pool drains,
        // whether or not anyone is waiting on the runner
        let supervisor = thread::spawn(move || {
            let mut first = None;
            for _ in 0..threads {
                match done_rx.recv() {
                    Ok(Some(err)) if first.is_none() => first = Some(err),
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            debug!("stage pool drained");
            stage.finish(first.as_ref());
            first
        });

        Ok(Self {
            workers,
            supervisor,
        })
    }

    /// Join all workers and surface the first fatal error
    pub fn wait(self) -> Result<()> {
        for handle in self.workers {
            let _ = handle.join();
        }
        match self.supervisor.join() {
            Ok(Some(err)) => Err(err),
            _ => Ok(()),
        }
    }
}

fn worker_loop<S: Stage>(
    stage: &S,
    input: &Arc<PacketBuffer>,
    output: Option<&Arc<PacketBuffer>>,
) -> Result<()> {
    loop {
        let reader = match input.open_read() {
            Ok(reader) => reader,
            // cancellation drains the pool cleanly
            Err(GlcastError::Cancelled) => return Ok(()),
            Err(err) => return Err(err),
        };

        let data = reader.data();
        let header = MsgHeader::decode(data)?;
        let payload = &data[MSG_HEADER_SIZE..];

        let action = stage.read(&header, payload)?;

        let Some(out_buf) = output else {
            continue;
        };

        let mut writer = match out_buf.open_write() {
            Ok(writer) => writer,
            Err(GlcastError::Cancelled) => return Ok(()),
            Err(err) => return Err(err),
        };

        match action {
            ReadAction::Copy => {
                writer.set_size(data.len())?;
                writer.write(data)?;
            }
            ReadAction::Rewrite(bytes) => {
                writer.set_size(MSG_HEADER_SIZE + bytes.len())?;
                writer.write(&header.to_bytes())?;
                writer.write(&bytes)?;
            }
            ReadAction::Produce { size, job } => {
                writer.set_size(MSG_HEADER_SIZE + size)?;
                writer.write(&header.to_bytes())?;
                let region = writer.dma(size)?;
                stage.write(job, &header, payload, region)?;
            }
        }
        writer.close()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{assemble, MsgKind};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CopyStage;

    impl Stage for CopyStage {
        type Job = ();

        fn read(&self, _header: &MsgHeader, _payload: &[u8]) -> Result<ReadAction<()>> {
            Ok(ReadAction::Copy)
        }
    }

    struct DoubleStage;

    impl Stage for DoubleStage {
        type Job = usize;

        fn read(&self, _header: &MsgHeader, payload: &[u8]) -> Result<ReadAction<usize>> {
            Ok(ReadAction::Produce {
                size: payload.len() * 2,
                job: payload.len(),
            })
        }

        fn write(
            &self,
            job: usize,
            _header: &MsgHeader,
            payload: &[u8],
            out: &mut [u8],
        ) -> Result<()> {
            assert_eq!(job, payload.len());
            out[..job].copy_from_slice(payload);
            out[job..].copy_from_slice(payload);
            Ok(())
        }
    }

    struct CountStage {
        seen: AtomicUsize,
        finished: AtomicBool,
    }

    impl Stage for CountStage {
        type Job = ();

        fn read(&self, _header: &MsgHeader, _payload: &[u8]) -> Result<ReadAction<()>> {
            self.seen.fetch_add(1, Ordering::Relaxed);
            Ok(ReadAction::Copy)
        }

        fn finish(&self, err: Option<&GlcastError>) {
            assert!(err.is_none());
            self.finished.store(true, Ordering::Release);
        }
    }

    struct FailStage;

    impl Stage for FailStage {
        type Job = ();

        fn read(&self, _header: &MsgHeader, _payload: &[u8]) -> Result<ReadAction<()>> {
            Err(GlcastError::InvalidArgument("boom"))
        }
    }

    fn push(buffer: &Arc<PacketBuffer>, kind: MsgKind, payload: &[u8]) {
        let bytes = assemble(kind, payload);
        let mut writer = buffer.open_write().unwrap();
        writer.set_size(bytes.len()).unwrap();
        writer.write(&bytes).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_copy_through() {
        let input = PacketBuffer::new(1024);
        let output = PacketBuffer::new(1024);

        let runner = ThreadRunner::spawn(
            Arc::new(CopyStage),
            2,
            input.clone(),
            Some(output.clone()),
        )
        .unwrap();

        push(&input, MsgKind::AudioData, b"pcm bytes");
        let reader = output.open_read().unwrap();
        assert_eq!(reader.data(), assemble(MsgKind::AudioData, b"pcm bytes"));
        drop(reader);

        input.cancel();
        runner.wait().unwrap();
    }

    #[test]
    fn test_produce_fills_reserved_region() {
        let input = PacketBuffer::new(1024);
        let output = PacketBuffer::new(1024);

        let runner = ThreadRunner::spawn(
            Arc::new(DoubleStage),
            1,
            input.clone(),
            Some(output.clone()),
        )
        .unwrap();

        push(&input, MsgKind::VideoFrame, b"abc");
        let reader = output.open_read().unwrap();
        assert_eq!(reader.data(), assemble(MsgKind::VideoFrame, b"abcabc"));
        drop(reader);

        input.cancel();
        runner.wait().unwrap();
    }

    #[test]
    fn test_read_only_stage_and_finish() {
        let input = PacketBuffer::new(1024);
        let stage = Arc::new(CountStage {
            seen: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        });

        let runner = ThreadRunner::spawn(stage.clone(), 3, input.clone(), None).unwrap();

        for _ in 0..10 {
            push(&input, MsgKind::Color, &[0u8; 24]);
        }
        while input.pending() > 0 {
            thread::yield_now();
        }

        input.cancel();
        runner.wait().unwrap();

        assert_eq!(stage.seen.load(Ordering::Relaxed), 10);
        assert!(stage.finished.load(Ordering::Acquire));
    }

    #[test]
    fn test_worker_error_cancels_buffers() {
        let input = PacketBuffer::new(1024);
        let output = PacketBuffer::new(1024);

        let runner = ThreadRunner::spawn(
            Arc::new(FailStage),
            2,
            input.clone(),
            Some(output.clone()),
        )
        .unwrap();

        push(&input, MsgKind::Close, &[]);

        assert!(matches!(
            runner.wait(),
            Err(GlcastError::InvalidArgument(_))
        ));
        assert!(input.is_cancelled());
        assert!(output.is_cancelled());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let input = PacketBuffer::new(64);
        assert!(ThreadRunner::spawn(Arc::new(CopyStage), 0, input, None).is_err());
    }
}

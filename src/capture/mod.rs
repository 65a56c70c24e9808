//! Frame capture stage: time-gated sampling of rendering surfaces
//!
//! [`FrameCapture::frame`] is called by the host library hook from
//! arbitrary rendering threads, once per presented frame per surface. The
//! stage gates calls to the target rate, maintains one capture stream per
//! (display, surface) pair, emits format and color messages when either
//! changes, and writes frame messages into the packet buffer, either by a
//! synchronous pixel read straight into the packet's reserved region or
//! through an asynchronous device-side transfer retrieved one call later.
//!
//! `stop()` is a barrier: it clears the capture flag, then waits for every
//! in-flight `frame` call to leave the critical path, so reconfiguration
//! after it returns cannot race.

mod source;

pub use source::{DisplayId, FrameSource, ReadBuffer, ReadRequest, SurfaceId, TransferId};

use crate::buffer::{CancelFlag, PacketBuffer};
use crate::error::{GlcastError, Result};
use crate::message::{
    ColorMsg, FrameHeader, MsgHeader, MsgKind, PixelFormat, VideoFlags, VideoFormatMsg,
    COLOR_MSG_SIZE, FRAME_HEADER_SIZE, MSG_HEADER_SIZE, VIDEO_FORMAT_SIZE,
};
use crate::sync::{FpsPacing, MonotonicClock};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// global capture flags
const TRY_ASYNC: u32 = 0x01;
const USE_ASYNC: u32 = 0x02;
const CAPTURING: u32 = 0x04;
const DRAW_INDICATOR: u32 = 0x08;
const LOCK_FPS: u32 = 0x10;
const IGNORE_TIME: u32 = 0x20;

// per-stream flags
const STREAM_CAPTURING: u32 = 0x01;
const NEED_COLOR_UPDATE: u32 = 0x02;

/// Crop rectangle in surface coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

#[derive(Clone)]
struct CaptureConfig {
    pacing: FpsPacing,
    read_buffer: ReadBuffer,
    format: PixelFormat,
    bpp: usize,
    pack_alignment: u32,
    crop: Option<CropRect>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            // 30 fps, dword-aligned BGRA from the front buffer
            pacing: FpsPacing {
                period_ns: 33_333_333,
                rem_ns: 1,
                rem_period: 3,
            },
            read_buffer: ReadBuffer::Front,
            format: PixelFormat::Bgra,
            bpp: 4,
            pack_alignment: 8,
            crop: None,
        }
    }
}

/// Geometry and transfer state of one capture stream, owned by its
/// rendering thread for the duration of a frame call
struct StreamState {
    w: u32,
    h: u32,
    cw: u32,
    ch: u32,
    cx: u32,
    cy: u32,
    row: usize,
    /// Pixel format and alignment snapshotted at stream initialisation so
    /// every frame matches the last emitted format message
    format: Option<PixelFormat>,
    bpp: usize,
    pack_alignment: u32,
    msg_flags: VideoFlags,
    screen: i32,
    gamma: (f32, f32, f32),
    /// Deadline bookkeeping for the rate gate
    last: u64,
    /// Sampling instant of the transfer currently in flight
    pbo_time: u64,
    transfer: Option<TransferId>,
    num_frames: u64,
    num_captured: u64,
    capture_time_ns: u64,
}

struct CaptureStream {
    id: u32,
    display: DisplayId,
    surface: SurfaceId,
    flags: AtomicU32,
    /// Set once the first asynchronous transfer has been kicked off
    transfer_armed: AtomicBool,
    state: Mutex<StreamState>,
}

/// Frame capture stage over a [`FrameSource`]
pub struct FrameCapture<S: FrameSource> {
    source: Arc<S>,
    to: Arc<PacketBuffer>,
    cancel: CancelFlag,
    clock: MonotonicClock,
    flags: AtomicU32,
    config: Mutex<CaptureConfig>,
    streams: Mutex<HashMap<(DisplayId, SurfaceId), Arc<CaptureStream>>>,
    next_id: AtomicU32,
}

impl<S: FrameSource> FrameCapture<S> {
    pub fn new(source: Arc<S>, to: Arc<PacketBuffer>, cancel: CancelFlag) -> Self {
        cancel.register(&to);
        Self {
            source,
            to,
            cancel,
            clock: MonotonicClock::new(),
            flags: AtomicU32::new(0),
            config: Mutex::new(CaptureConfig::default()),
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Set the target frame rate
    pub fn set_fps(&self, fps: f64) -> Result<()> {
        let pacing = FpsPacing::from_fps(fps)?;
        info!(
            "capturing at {fps} fps, interval {} ns with a correction of {} ns every {} frames",
            pacing.period_ns, pacing.rem_ns, pacing.rem_period
        );
        self.config.lock().pacing = pacing;
        Ok(())
    }

    /// Choose the hardware buffer frames are read from
    pub fn set_read_buffer(&self, buffer: ReadBuffer) {
        match buffer {
            ReadBuffer::Front => info!("reading frames from the front buffer"),
            ReadBuffer::Back => info!("reading frames from the back buffer"),
        }
        self.config.lock().read_buffer = buffer;
    }

    /// Set the capture pixel format; only packed BGR and BGRA are readable
    pub fn set_pixel_format(&self, format: PixelFormat) -> Result<()> {
        let bpp = match format {
            PixelFormat::Bgra => 4,
            PixelFormat::Bgr => 3,
            PixelFormat::Ycbcr420Jpeg => {
                error!("unsupported capture pixel format");
                return Err(GlcastError::NotSupported("capture pixel format"));
            }
        };
        info!("reading frames as {format:?}");
        let mut config = self.config.lock();
        config.format = format;
        config.bpp = bpp;
        Ok(())
    }

    /// Set the row pack alignment; 8 marks streams dword-aligned
    pub fn set_pack_alignment(&self, alignment: u32) -> Result<()> {
        match alignment {
            1 => info!("reading data as byte aligned"),
            8 => info!("reading data as dword aligned"),
            _ => {
                error!("unknown pack alignment {alignment}");
                return Err(GlcastError::NotSupported("pack alignment"));
            }
        }
        self.config.lock().pack_alignment = alignment;
        Ok(())
    }

    /// Enable or disable probing for asynchronous transfer; disabling is
    /// rejected while a transfer object is live
    pub fn set_try_async_transfer(&self, try_async: bool) -> Result<()> {
        if try_async {
            self.flags.fetch_or(TRY_ASYNC, Ordering::AcqRel);
        } else {
            if self.flags.load(Ordering::Acquire) & USE_ASYNC != 0 {
                warn!("can't disable asynchronous transfer; it is in use");
                return Err(GlcastError::AlreadyRunning);
            }
            debug!("asynchronous transfer disabled");
            self.flags.fetch_and(!TRY_ASYNC, Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn set_draw_indicator(&self, draw: bool) {
        if draw {
            self.flags.fetch_or(DRAW_INDICATOR, Ordering::AcqRel);
            if self.config.lock().read_buffer == ReadBuffer::Front {
                warn!("indicator doesn't work well when capturing from the front buffer");
            }
        } else {
            self.flags.fetch_and(!DRAW_INDICATOR, Ordering::AcqRel);
        }
    }

    pub fn set_ignore_time(&self, ignore: bool) {
        if ignore {
            self.flags.fetch_or(IGNORE_TIME, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!IGNORE_TIME, Ordering::AcqRel);
        }
    }

    pub fn set_lock_fps(&self, lock: bool) {
        if lock {
            self.flags.fetch_or(LOCK_FPS, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!LOCK_FPS, Ordering::AcqRel);
        }
    }

    /// Set or clear the capture crop rectangle
    pub fn set_crop(&self, crop: Option<CropRect>) {
        self.config.lock().crop = crop;
    }

    /// Begin capturing; idempotent
    pub fn start(&self) -> Result<()> {
        if self.flags.load(Ordering::Acquire) & CAPTURING != 0 {
            warn!("capturing is already active");
        } else {
            info!("starting capturing");
        }
        self.flags.fetch_or(CAPTURING, Ordering::AcqRel);
        Ok(())
    }

    /// Stop capturing and wait until every in-flight frame call drains
    pub fn stop(&self) {
        if self.flags.load(Ordering::Acquire) & CAPTURING == 0 {
            warn!("capturing is already stopped");
            return;
        }

        {
            let _guard = self.streams.lock();
            self.flags.fetch_and(!CAPTURING, Ordering::AcqRel);
        }
        info!("stopping capturing");

        let streams: Vec<_> = self.streams.lock().values().cloned().collect();
        for stream in streams {
            while stream.flags.load(Ordering::Acquire) & STREAM_CAPTURING != 0 {
                thread::sleep(Duration::from_millis(1));
            }
            stream.state.lock().last = 0;
        }
    }

    /// Force a color message on every stream's next frame
    pub fn refresh_color_correction(&self) {
        info!("refreshing color correction");
        for stream in self.streams.lock().values() {
            stream.flags.fetch_or(NEED_COLOR_UPDATE, Ordering::AcqRel);
        }
    }

    /// Capture one frame from the given surface, subject to the rate gate
    ///
    /// Called concurrently from one host thread per rendering context; two
    /// calls for the same surface never overlap.
    pub fn frame(&self, display: DisplayId, surface: SurfaceId) -> Result<()> {
        let stream = {
            let mut streams = self.streams.lock();
            if self.flags.load(Ordering::Acquire) & CAPTURING == 0 {
                return Ok(());
            }
            let stream = streams
                .entry((display, surface))
                .or_insert_with(|| {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    debug!(id, "new capture stream");
                    Arc::new(CaptureStream {
                        id,
                        display,
                        surface,
                        flags: AtomicU32::new(NEED_COLOR_UPDATE),
                        transfer_armed: AtomicBool::new(false),
                        state: Mutex::new(StreamState {
                            w: 0,
                            h: 0,
                            cw: 0,
                            ch: 0,
                            cx: 0,
                            cy: 0,
                            row: 0,
                            format: None,
                            bpp: 0,
                            pack_alignment: 8,
                            msg_flags: VideoFlags::empty(),
                            screen: 0,
                            gamma: (1.0, 1.0, 1.0),
                            last: 0,
                            pbo_time: 0,
                            transfer: None,
                            num_frames: 0,
                            num_captured: 0,
                            capture_time_ns: 0,
                        }),
                    })
                })
                .clone();
            stream.flags.fetch_or(STREAM_CAPTURING, Ordering::AcqRel);
            stream
        };

        let result = self.frame_inner(&stream);
        stream.flags.fetch_and(!STREAM_CAPTURING, Ordering::AcqRel);

        match result {
            Ok(()) => {}
            // an externally cancelled buffer means the pipeline is
            // winding down; unwind quietly
            Err(GlcastError::Cancelled) => return Ok(()),
            Err(err) => {
                self.error(&err);
                return Err(err);
            }
        }

        if self.flags.load(Ordering::Acquire) & DRAW_INDICATOR != 0 {
            let st = stream.state.lock();
            let (w, h) = (st.w, st.h);
            drop(st);
            let _ = self.source.draw_indicator(display, surface, w, h);
        }

        Ok(())
    }

    fn frame_inner(&self, stream: &CaptureStream) -> Result<()> {
        let flags = self.flags.load(Ordering::Acquire);
        let config = self.config.lock().clone();
        let period = config.pacing.period_ns;
        let mut st = stream.state.lock();

        let now = if flags & IGNORE_TIME != 0 {
            st.last + period
        } else {
            self.clock.now_ns()
        };

        // rate gate; a stream that has never captured is not gated
        if st.last != 0
            && now.saturating_sub(st.last) < period
            && flags & LOCK_FPS == 0
            && flags & IGNORE_TIME == 0
        {
            return Ok(());
        }

        if st.last != 0 && now.saturating_sub(st.last) > 8 * period {
            warn!(
                id = stream.id,
                "first frame after {} nsec",
                now.saturating_sub(st.last)
            );
        }

        self.update_stream(stream, &mut st, &config)?;
        st.num_frames += 1;

        let flags = self.flags.load(Ordering::Acquire);
        let use_async = flags & USE_ASYNC != 0 && st.transfer.is_some();

        // first asynchronous call only starts the transfer; the frame is
        // materialised on the next one
        if use_async
            && stream
                .transfer_armed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let req = self.read_request(stream, &st, &config);
            self.source.begin_transfer(st.transfer.unwrap(), &req)?;
            st.pbo_time = now;
            return Ok(());
        }

        let blocking = flags & (LOCK_FPS | IGNORE_TIME) != 0;
        let mut writer = if blocking {
            self.to.open_write()?
        } else {
            self.to.open_write_try()?
        };

        let payload = st.row * st.ch as usize;
        match writer.set_size(MSG_HEADER_SIZE + FRAME_HEADER_SIZE + payload) {
            Ok(()) => {}
            Err(GlcastError::Busy) => {
                info!(
                    id = stream.id,
                    "dropped frame #{}, buffer not ready", st.num_frames
                );
                writer.cancel();
                return Ok(());
            }
            Err(err) => {
                writer.cancel();
                return Err(err);
            }
        }

        writer.write(&MsgHeader::new(MsgKind::VideoFrame).to_bytes())?;
        // an in-flight transfer carries the previous sampling instant;
        // guard against a pbo_time ahead of now after a pacing reset
        let time = if use_async && st.pbo_time < now {
            st.pbo_time
        } else {
            now
        };
        writer.write(
            &FrameHeader {
                time,
                id: stream.id,
            }
            .to_bytes(),
        )?;

        let before = self.clock.now_ns();
        let req = self.read_request(stream, &st, &config);
        if use_async {
            let transfer = st.transfer.unwrap();
            self.source.map_transfer(transfer, writer.dma(payload)?)?;
            self.source.begin_transfer(transfer, &req)?;
            st.pbo_time = now;
        } else {
            self.source.read_pixels(&req, writer.dma(payload)?)?;
        }
        st.capture_time_ns += self.clock.now_ns() - before;

        writer.close()?;
        st.num_captured += 1;

        if flags & LOCK_FPS != 0 && flags & IGNORE_TIME == 0 {
            let now = self.clock.now_ns();
            if now.saturating_sub(st.last) < period {
                thread::sleep(Duration::from_nanos(period + st.last - now));
            }
        }

        // advance the deadline by exactly one period, amortising the
        // rational remainder
        st.last += period;
        if st.num_captured % config.pacing.rem_period == 0 {
            st.last += config.pacing.rem_ns;
        }

        Ok(())
    }

    /// Refresh geometry, format, color and async state before a capture
    fn update_stream(
        &self,
        stream: &CaptureStream,
        st: &mut StreamState,
        config: &CaptureConfig,
    ) -> Result<()> {
        // resolve asynchronous transfer support once
        if self.flags.load(Ordering::Acquire) & (TRY_ASYNC | USE_ASYNC) == TRY_ASYNC {
            if self.source.async_transfer_supported() {
                info!("using asynchronous frame transfer");
                self.flags.fetch_or(USE_ASYNC, Ordering::AcqRel);
            } else {
                self.flags.fetch_and(!TRY_ASYNC, Ordering::AcqRel);
            }
        }

        let (w, h) = self.source.geometry(stream.display, stream.surface)?;

        if st.format.is_none() {
            st.format = Some(config.format);
            st.bpp = config.bpp;
            st.pack_alignment = config.pack_alignment;
            st.msg_flags = if config.pack_alignment == 8 {
                VideoFlags::DWORD_ALIGNED
            } else {
                VideoFlags::empty()
            };
            st.gamma = (1.0, 1.0, 1.0);
        }

        if w != st.w || h != st.h {
            self.write_format_message(stream, st, config, w, h)?;
        }

        if stream.flags.load(Ordering::Acquire) & NEED_COLOR_UPDATE != 0 {
            self.update_color(stream, st)?;
        }

        Ok(())
    }

    /// Recompute the capture area and row stride for a new surface size
    fn calc_geometry(&self, stream: &CaptureStream, st: &mut StreamState, config: &CaptureConfig, w: u32, h: u32) {
        st.w = w;
        st.h = h;

        if let Some(crop) = config.crop {
            st.cx = if crop.x > st.w { 0 } else { crop.x };
            st.cy = if crop.y > st.h { 0 } else { crop.y };
            st.cw = if crop.w + st.cx > st.w {
                st.w - st.cx
            } else {
                crop.w
            };
            st.ch = if crop.h + st.cy > st.h {
                st.h - st.cy
            } else {
                crop.h
            };
            // readback origin is the bottom-left corner
            st.cy = st.h - st.ch - st.cy;
        } else {
            st.cw = st.w;
            st.ch = st.h;
            st.cx = 0;
            st.cy = 0;
        }

        debug!(
            id = stream.id,
            "calculated capture area {}x{}+{}+{}", st.cw, st.ch, st.cx, st.cy
        );

        st.row = st.cw as usize * st.bpp;
        if st.row % st.pack_alignment as usize != 0 {
            st.row += st.pack_alignment as usize - st.row % st.pack_alignment as usize;
        }
    }

    fn write_format_message(
        &self,
        stream: &CaptureStream,
        st: &mut StreamState,
        config: &CaptureConfig,
        w: u32,
        h: u32,
    ) -> Result<()> {
        self.calc_geometry(stream, st, config, w, h);

        info!(id = stream.id, "creating/updating stream configuration");

        let msg = VideoFormatMsg {
            id: stream.id,
            flags: st.msg_flags,
            width: st.cw,
            height: st.ch,
            format: st.format.expect("format initialised before geometry"),
        };

        let mut writer = self.to.open_write()?;
        writer.set_size(MSG_HEADER_SIZE + VIDEO_FORMAT_SIZE)?;
        writer.write(&MsgHeader::new(MsgKind::VideoFormat).to_bytes())?;
        writer.write(&msg.to_bytes())?;
        writer.close()?;

        debug!(
            id = stream.id,
            "stream {}x{} ({}x{}), flags {:?}", st.cw, st.ch, st.w, st.h, st.msg_flags
        );

        if self.flags.load(Ordering::Acquire) & USE_ASYNC != 0 {
            if let Some(old) = st.transfer.take() {
                debug!(id = stream.id, "destroying staging buffer");
                let _ = self.source.destroy_transfer(old);
            }
            match self.source.create_transfer(st.row * st.ch as usize) {
                Ok(transfer) => st.transfer = Some(transfer),
                Err(err) => {
                    warn!("staging buffer allocation failed: {err}");
                    self.flags.fetch_and(!(TRY_ASYNC | USE_ASYNC), Ordering::AcqRel);
                }
            }
        }

        Ok(())
    }

    /// Poll display gamma; emit a color message when it changed
    fn update_color(&self, stream: &CaptureStream, st: &mut StreamState) -> Result<()> {
        stream.flags.fetch_and(!NEED_COLOR_UPDATE, Ordering::AcqRel);

        let (red, green, blue) = self.source.gamma(stream.display, st.screen)?;
        if (red, green, blue) == st.gamma {
            return Ok(());
        }
        st.gamma = (red, green, blue);

        let msg = ColorMsg {
            id: stream.id,
            brightness: 0.0,
            contrast: 0.0,
            red,
            green,
            blue,
        };
        info!(
            id = stream.id,
            "color correction: red={red}, green={green}, blue={blue}"
        );

        let write = || -> Result<()> {
            let mut writer = self.to.open_write()?;
            writer.set_size(MSG_HEADER_SIZE + COLOR_MSG_SIZE)?;
            writer.write(&MsgHeader::new(MsgKind::Color).to_bytes())?;
            writer.write(&msg.to_bytes())?;
            writer.close()
        };
        write().map_err(|err| {
            if !matches!(err, GlcastError::Cancelled) {
                error!("can't write color correction to buffer: {err}");
            }
            err
        })
    }

    fn read_request(
        &self,
        stream: &CaptureStream,
        st: &StreamState,
        config: &CaptureConfig,
    ) -> ReadRequest {
        ReadRequest {
            display: stream.display,
            surface: stream.surface,
            x: st.cx,
            y: st.cy,
            w: st.cw,
            h: st.ch,
            format: st.format.unwrap_or(PixelFormat::Bgra),
            pack_alignment: st.pack_alignment,
            buffer: config.read_buffer,
        }
    }

    /// Fatal write-path error: stop capturing, cancel the pipeline
    fn error(&self, err: &GlcastError) {
        error!("capture error: {err}");
        if self.flags.load(Ordering::Acquire) & CAPTURING != 0 {
            self.stop();
        }
        self.cancel.set();
    }
}

impl<S: FrameSource> Drop for FrameCapture<S> {
    fn drop(&mut self) {
        for stream in self.streams.lock().values() {
            let mut st = stream.state.lock();
            debug!(
                id = stream.id,
                perf = true,
                "captured {} frames in {} nsec", st.num_captured, st.capture_time_ns
            );
            if let Some(transfer) = st.transfer.take() {
                let _ = self.source.destroy_transfer(transfer);
            }
        }
    }
}

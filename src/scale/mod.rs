//! Parallel bilinear scaling and pixel format conversion stage
//!
//! Consumes video messages from a packet buffer and writes downscaled,
//! BGR-packed frames out. Per stream the stage precomputes a resample
//! table: four source byte offsets and four bilinear weights per target
//! pixel. Two specialised paths skip the tables: plain BGRA->BGR repacking
//! at scale 1 and a 2x2 box filter at scale 1/2.
//!
//! Reconfiguration (a new format message) takes the stream's writer lock;
//! frame resampling holds the reader lock from the runner's read phase
//! through its write phase, so an in-flight frame always sees a consistent
//! geometry/table set.

use crate::error::{GlcastError, Result};
use crate::message::{
    FrameHeader, MsgHeader, MsgKind, PixelFormat, VideoFlags, VideoFormatMsg, FRAME_HEADER_SIZE,
};
use crate::runner::{ReadAction, Stage};
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Per-stream scaling state, guarded by a readers-writer lock
#[derive(Default)]
pub struct ScaleState {
    /// Source geometry
    w: u32,
    h: u32,
    /// Target geometry
    sw: u32,
    sh: u32,
    /// Source bytes per pixel (4 for BGRA, 3 for BGR)
    bpp: usize,
    /// Source row stride in bytes, padding included
    row: usize,
    scale: f64,
    /// False while the stream passes through unmodified
    process: bool,
    /// Four source byte offsets per target pixel
    pos: Vec<u32>,
    /// Four bilinear weights per target pixel, summing to one
    factor: Vec<f32>,
}

pub type StateGuard = ArcRwLockReadGuard<RawRwLock, ScaleState>;

/// Scale stage: hosts per-stream resample state behind a [`Stage`] impl
pub struct ScaleStage {
    scale: f64,
    streams: Mutex<HashMap<u32, Arc<RwLock<ScaleState>>>>,
}

impl ScaleStage {
    /// Create a stage scaling by `scale`, which must be in (0, 1];
    /// 1 means no resampling (format conversion may still apply)
    pub fn new(scale: f64) -> Result<Self> {
        if !(scale > 0.0 && scale <= 1.0) {
            return Err(GlcastError::InvalidArgument("scale must be in (0, 1]"));
        }
        Ok(Self {
            scale,
            streams: Mutex::new(HashMap::new()),
        })
    }

    fn stream(&self, id: u32) -> Arc<RwLock<ScaleState>> {
        self.streams
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(ScaleState::default())))
            .clone()
    }

    /// Apply a format message; returns the rewritten message, or None to
    /// forward the original unchanged
    fn handle_format(&self, msg: &VideoFormatMsg) -> Result<Option<VideoFormatMsg>> {
        let stream = self.stream(msg.id);
        let mut state = stream.write();

        state.w = msg.width;
        state.h = msg.height;

        match msg.format {
            PixelFormat::Bgra => state.bpp = 4,
            PixelFormat::Bgr => {
                if self.scale == 1.0 {
                    // nothing to scale, nothing to convert
                    state.sw = state.w;
                    state.sh = state.h;
                    state.scale = 1.0;
                    state.process = false;
                    return Ok(None);
                }
                state.bpp = 3;
            }
            PixelFormat::Ycbcr420Jpeg => {
                // planar streams are not resampled here
                state.process = false;
                return Ok(None);
            }
        }

        state.process = true;
        state.scale = self.scale;
        state.sw = (self.scale * state.w as f64) as u32;
        state.sh = (self.scale * state.h as f64) as u32;
        state.row = state.w as usize * state.bpp;
        if msg.flags.contains(VideoFlags::DWORD_ALIGNED) && state.row % 8 != 0 {
            state.row += 8 - state.row % 8;
        }

        // target is always packed BGR
        let out = VideoFormatMsg {
            id: msg.id,
            flags: msg.flags & !VideoFlags::DWORD_ALIGNED,
            width: state.sw,
            height: state.sh,
            format: PixelFormat::Bgr,
        };

        if state.scale == 0.5 || state.scale == 1.0 {
            // fast paths need no resample tables
            return Ok(Some(out));
        }

        build_tables(&mut state)?;
        debug!(
            id = msg.id,
            sw = state.sw,
            sh = state.sh,
            "generated {} entry resample table",
            state.pos.len()
        );

        Ok(Some(out))
    }
}

/// Precompute the bilinear resample tables for the current geometry.
/// Allocation failure surfaces as an error so the hosting worker exits
/// instead of aborting the process.
fn build_tables(state: &mut ScaleState) -> Result<()> {
    let (w, h) = (state.w as f32, state.h as f32);
    let (sw, sh) = (state.sw as usize, state.sh as usize);
    let (bpp, row) = (state.bpp, state.row);

    let entries = sw
        .checked_mul(sh)
        .and_then(|n| n.checked_mul(4))
        .ok_or(GlcastError::Allocation("resample table"))?;

    // smallest fractional step that keeps every 2x2 neighbourhood inside
    // the source image
    let mut r = 0u32;
    let d = loop {
        let d = (state.w - r) as f32 / state.sw as f32;
        r += 1;
        if !(d * (sh as f32 - 1.0) + 1.0 > h || d * (sw as f32 - 1.0) + 1.0 > w) {
            break d;
        }
    };

    state.pos.clear();
    state
        .pos
        .try_reserve_exact(entries)
        .map_err(|_| GlcastError::Allocation("resample table"))?;
    state.pos.resize(entries, 0);
    state.factor.clear();
    state
        .factor
        .try_reserve_exact(entries)
        .map_err(|_| GlcastError::Allocation("resample table"))?;
    state.factor.resize(entries, 0.0);

    let mut ofy = 0.0f32;
    for y in 0..sh {
        let mut ofx = 0.0f32;
        for x in 0..sw {
            let tp = (x + y * sw) * 4;
            let (ix, iy) = (ofx as usize, ofy as usize);

            state.pos[tp] = (ix * bpp + iy * row) as u32;
            state.pos[tp + 1] = ((ix + 1) * bpp + iy * row) as u32;
            state.pos[tp + 2] = (ix * bpp + (iy + 1) * row) as u32;
            state.pos[tp + 3] = ((ix + 1) * bpp + (iy + 1) * row) as u32;

            let fx1 = x as f32 * d - ix as f32;
            let fx0 = 1.0 - fx1;
            let fy1 = y as f32 * d - iy as f32;
            let fy0 = 1.0 - fy1;

            state.factor[tp] = fx0 * fy0;
            state.factor[tp + 1] = fx1 * fy0;
            state.factor[tp + 2] = fx0 * fy1;
            state.factor[tp + 3] = fx1 * fy1;

            ofx += d;
        }
        ofy += d;
    }

    Ok(())
}

/// Resample or repack one frame into the reserved output region
fn scale_frame(state: &ScaleState, from: &[u8], to: &mut [u8]) {
    let (sw, sh) = (state.sw as usize, state.sh as usize);
    let (bpp, row) = (state.bpp, state.row);

    if state.scale == 1.0 && bpp == 4 {
        // BGRA -> BGR repack
        for y in 0..sh {
            for x in 0..sw {
                let tp = (x + y * sw) * 3;
                let op = x * bpp + y * row;
                to[tp] = from[op];
                to[tp + 1] = from[op + 1];
                to[tp + 2] = from[op + 2];
            }
        }
        return;
    }

    if state.scale == 0.5 {
        // 2x2 box filter
        for y in 0..sh {
            for x in 0..sw {
                let tp = (x + y * sw) * 3;
                let op1 = 2 * x * bpp + 2 * y * row;
                let op2 = op1 + bpp;
                let op3 = op1 + row;
                let op4 = op1 + bpp + row;
                for c in 0..3 {
                    to[tp + c] = ((from[op1 + c] as u32
                        + from[op2 + c] as u32
                        + from[op3 + c] as u32
                        + from[op4 + c] as u32)
                        >> 2) as u8;
                }
            }
        }
        return;
    }

    for y in 0..sh {
        for x in 0..sw {
            let sp = (x + y * sw) * 4;
            let tp = (x + y * sw) * 3;
            for c in 0..3 {
                let mut acc = 0.0f32;
                for i in 0..4 {
                    acc += from[state.pos[sp + i] as usize + c] as f32 * state.factor[sp + i];
                }
                to[tp + c] = acc as u8;
            }
        }
    }
}

impl Stage for ScaleStage {
    type Job = StateGuard;

    fn read(&self, header: &MsgHeader, payload: &[u8]) -> Result<ReadAction<StateGuard>> {
        match header.kind {
            MsgKind::VideoFormat => {
                let msg = VideoFormatMsg::decode(payload)?;
                match self.handle_format(&msg)? {
                    Some(out) => Ok(ReadAction::Rewrite(out.to_bytes().to_vec())),
                    None => Ok(ReadAction::Copy),
                }
            }
            MsgKind::VideoFrame => {
                let frame = FrameHeader::decode(payload)?;
                let stream = self.stream(frame.id);
                let guard = stream.read_arc();

                if !guard.process {
                    return Ok(ReadAction::Copy);
                }
                if payload.len() < FRAME_HEADER_SIZE + guard.row * guard.h as usize {
                    return Err(GlcastError::InvalidArgument(
                        "frame shorter than announced geometry",
                    ));
                }
                Ok(ReadAction::Produce {
                    size: guard.sw as usize * guard.sh as usize * 3 + FRAME_HEADER_SIZE,
                    job: guard,
                })
            }
            _ => Ok(ReadAction::Copy),
        }
    }

    fn write(
        &self,
        guard: StateGuard,
        _header: &MsgHeader,
        payload: &[u8],
        out: &mut [u8],
    ) -> Result<()> {
        out[..FRAME_HEADER_SIZE].copy_from_slice(&payload[..FRAME_HEADER_SIZE]);
        scale_frame(
            &guard,
            &payload[FRAME_HEADER_SIZE..],
            &mut out[FRAME_HEADER_SIZE..],
        );
        Ok(())
    }

    fn finish(&self, err: Option<&GlcastError>) {
        if let Some(err) = err {
            error!("scale stage failed: {err}");
        }
        self.streams.lock().clear();
    }
}

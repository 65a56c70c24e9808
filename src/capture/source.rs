//! Rendering-surface provider seam
//!
//! The capture stage never talks to a graphics API directly; the host
//! library hook implements [`FrameSource`] over whatever stack it
//! intercepts. Adapters must bracket [`FrameSource::read_pixels`] with
//! save/restore of any pixel-store state they touch, so a capture call is
//! invisible to the host application.

use crate::error::{GlcastError, Result};
use crate::message::PixelFormat;

/// Opaque identifier of a display connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayId(pub u64);

/// Opaque identifier of a rendering surface (window or drawable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

/// Hardware buffer frames are sampled from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadBuffer {
    Front,
    Back,
}

/// One pixel read: the crop-corrected region, output format and row
/// alignment
#[derive(Debug, Clone, Copy)]
pub struct ReadRequest {
    pub display: DisplayId,
    pub surface: SurfaceId,
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub format: PixelFormat,
    pub pack_alignment: u32,
    pub buffer: ReadBuffer,
}

/// Identifier of a device-side staging buffer for asynchronous transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferId(pub u64);

/// Access to the host application's rendering surfaces
///
/// The asynchronous-transfer methods have the usual generate / start /
/// map semantics of a pixel-pack buffer. A provider without that
/// capability keeps the defaults; the capture stage then stays on the
/// synchronous path.
pub trait FrameSource: Send + Sync + 'static {
    /// Current (width, height) of the surface
    fn geometry(&self, display: DisplayId, surface: SurfaceId) -> Result<(u32, u32)>;

    /// Gamma ramp scalars (red, green, blue) of the display's screen
    fn gamma(&self, display: DisplayId, screen: i32) -> Result<(f32, f32, f32)>;

    /// Read the requested region synchronously into `dst`
    fn read_pixels(&self, req: &ReadRequest, dst: &mut [u8]) -> Result<()>;

    /// Whether the asynchronous-transfer extension is available
    fn async_transfer_supported(&self) -> bool {
        false
    }

    /// Allocate a device-side staging buffer of `size` bytes
    fn create_transfer(&self, size: usize) -> Result<TransferId> {
        let _ = size;
        Err(GlcastError::NotSupported("asynchronous transfer"))
    }

    /// Release a staging buffer
    fn destroy_transfer(&self, id: TransferId) -> Result<()> {
        let _ = id;
        Ok(())
    }

    /// Start copying the requested region into the staging buffer; the
    /// data is retrieved by a later `map_transfer`
    fn begin_transfer(&self, id: TransferId, req: &ReadRequest) -> Result<()> {
        let _ = (id, req);
        Err(GlcastError::NotSupported("asynchronous transfer"))
    }

    /// Map a previously started transfer and copy its contents into `dst`
    fn map_transfer(&self, id: TransferId, dst: &mut [u8]) -> Result<()> {
        let _ = (id, dst);
        Err(GlcastError::NotSupported("asynchronous transfer"))
    }

    /// Mark the surface visibly while capture is active
    fn draw_indicator(&self, display: DisplayId, surface: SurfaceId, w: u32, h: u32) -> Result<()> {
        let _ = (display, surface, w, h);
        Ok(())
    }
}

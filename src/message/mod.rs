//! Typed message model shared by all pipeline stages
//!
//! Every record in a packet buffer starts with a fixed-size [`MsgHeader`]
//! tagging the payload kind. Kind-specific payload structs follow, and for
//! video frames and audio data an opaque byte tail (pixels, PCM) sized by
//! the preceding format message or header field.
//!
//! All fields are encoded little-endian at fixed offsets so that every
//! stage, regardless of thread, decodes identical layouts.

use crate::error::{GlcastError, Result};

/// Size of the leading message header, shared by all stages
pub const MSG_HEADER_SIZE: usize = 8;
/// Size of an encoded [`VideoFormatMsg`]
pub const VIDEO_FORMAT_SIZE: usize = 20;
/// Size of an encoded [`FrameHeader`]
pub const FRAME_HEADER_SIZE: usize = 16;
/// Size of an encoded [`AudioFormatMsg`]
pub const AUDIO_FORMAT_SIZE: usize = 20;
/// Size of an encoded [`AudioDataHeader`]
pub const AUDIO_DATA_HEADER_SIZE: usize = 24;
/// Size of an encoded [`ColorMsg`]
pub const COLOR_MSG_SIZE: usize = 24;

/// Message kind tag carried in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    VideoFormat,
    VideoFrame,
    AudioFormat,
    AudioData,
    Color,
    Close,
    /// Any tag this version does not know; carried through verbatim
    Unknown(u8),
}

impl MsgKind {
    pub fn tag(self) -> u8 {
        match self {
            MsgKind::VideoFormat => 1,
            MsgKind::VideoFrame => 2,
            MsgKind::AudioFormat => 3,
            MsgKind::AudioData => 4,
            MsgKind::Color => 5,
            MsgKind::Close => 6,
            MsgKind::Unknown(tag) => tag,
        }
    }

    pub fn from_tag(tag: u8) -> Self {
        match tag {
            1 => MsgKind::VideoFormat,
            2 => MsgKind::VideoFrame,
            3 => MsgKind::AudioFormat,
            4 => MsgKind::AudioData,
            5 => MsgKind::Color,
            6 => MsgKind::Close,
            other => MsgKind::Unknown(other),
        }
    }
}

/// Fixed-layout message header: one tag byte plus reserved padding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub kind: MsgKind,
}

impl MsgHeader {
    pub fn new(kind: MsgKind) -> Self {
        Self { kind }
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[..MSG_HEADER_SIZE].fill(0);
        out[0] = self.kind.tag();
    }

    pub fn to_bytes(&self) -> [u8; MSG_HEADER_SIZE] {
        let mut buf = [0u8; MSG_HEADER_SIZE];
        self.encode(&mut buf);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MSG_HEADER_SIZE {
            return Err(GlcastError::InvalidArgument("message shorter than header"));
        }
        Ok(Self {
            kind: MsgKind::from_tag(bytes[0]),
        })
    }
}

/// Pixel format of a video stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Bgr,
    Bgra,
    Ycbcr420Jpeg,
}

impl PixelFormat {
    /// Bytes per pixel; planar YCbCr has no per-pixel size
    pub fn bpp(self) -> Option<usize> {
        match self {
            PixelFormat::Bgr => Some(3),
            PixelFormat::Bgra => Some(4),
            PixelFormat::Ycbcr420Jpeg => None,
        }
    }

    fn tag(self) -> u8 {
        match self {
            PixelFormat::Bgr => 1,
            PixelFormat::Bgra => 2,
            PixelFormat::Ycbcr420Jpeg => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(PixelFormat::Bgr),
            2 => Ok(PixelFormat::Bgra),
            3 => Ok(PixelFormat::Ycbcr420Jpeg),
            _ => Err(GlcastError::InvalidArgument("unknown pixel format tag")),
        }
    }
}

/// Sample format of an audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    S16Le,
    S24Le,
    S32Le,
}

impl SampleFormat {
    fn tag(self) -> u8 {
        match self {
            SampleFormat::S16Le => 1,
            SampleFormat::S24Le => 2,
            SampleFormat::S32Le => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(SampleFormat::S16Le),
            2 => Ok(SampleFormat::S24Le),
            3 => Ok(SampleFormat::S32Le),
            _ => Err(GlcastError::InvalidArgument("unknown sample format tag")),
        }
    }
}

bitflags::bitflags! {
    /// Per-stream video flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VideoFlags: u32 {
        /// Rows are padded to a multiple of 8 bytes
        const DWORD_ALIGNED = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Per-stream audio flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AudioFlags: u32 {
        /// Samples for all channels are interleaved
        const INTERLEAVED = 1 << 0;
    }
}

/// Video stream format announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormatMsg {
    pub id: u32,
    pub flags: VideoFlags,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl VideoFormatMsg {
    /// Byte length of one frame payload in this format, row padding included
    pub fn frame_size(&self) -> usize {
        let (w, h) = (self.width as usize, self.height as usize);
        match self.format {
            PixelFormat::Ycbcr420Jpeg => w * h * 3 / 2,
            packed => {
                let mut row = w * packed.bpp().unwrap_or(0);
                if self.flags.contains(VideoFlags::DWORD_ALIGNED) && row % 8 != 0 {
                    row += 8 - row % 8;
                }
                row * h
            }
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[..VIDEO_FORMAT_SIZE].fill(0);
        out[0..4].copy_from_slice(&self.id.to_le_bytes());
        out[4..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[8..12].copy_from_slice(&self.width.to_le_bytes());
        out[12..16].copy_from_slice(&self.height.to_le_bytes());
        out[16] = self.format.tag();
    }

    pub fn to_bytes(&self) -> [u8; VIDEO_FORMAT_SIZE] {
        let mut buf = [0u8; VIDEO_FORMAT_SIZE];
        self.encode(&mut buf);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < VIDEO_FORMAT_SIZE {
            return Err(GlcastError::InvalidArgument("short video format message"));
        }
        Ok(Self {
            id: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            flags: VideoFlags::from_bits_truncate(u32::from_le_bytes(
                bytes[4..8].try_into().unwrap(),
            )),
            width: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            height: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            format: PixelFormat::from_tag(bytes[16])?,
        })
    }
}

/// Header preceding the pixel bytes of one video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Capture timestamp, nanoseconds on the pipeline's monotonic clock
    pub time: u64,
    pub id: u32,
}

impl FrameHeader {
    pub fn encode(&self, out: &mut [u8]) {
        out[..FRAME_HEADER_SIZE].fill(0);
        out[0..8].copy_from_slice(&self.time.to_le_bytes());
        out[8..12].copy_from_slice(&self.id.to_le_bytes());
    }

    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        self.encode(&mut buf);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(GlcastError::InvalidArgument("short frame header"));
        }
        Ok(Self {
            time: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            id: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        })
    }
}

/// Audio stream format announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormatMsg {
    pub id: u32,
    pub flags: AudioFlags,
    pub rate: u32,
    pub channels: u32,
    pub format: SampleFormat,
}

impl AudioFormatMsg {
    pub fn encode(&self, out: &mut [u8]) {
        out[..AUDIO_FORMAT_SIZE].fill(0);
        out[0..4].copy_from_slice(&self.id.to_le_bytes());
        out[4..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[8..12].copy_from_slice(&self.rate.to_le_bytes());
        out[12..16].copy_from_slice(&self.channels.to_le_bytes());
        out[16] = self.format.tag();
    }

    pub fn to_bytes(&self) -> [u8; AUDIO_FORMAT_SIZE] {
        let mut buf = [0u8; AUDIO_FORMAT_SIZE];
        self.encode(&mut buf);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < AUDIO_FORMAT_SIZE {
            return Err(GlcastError::InvalidArgument("short audio format message"));
        }
        Ok(Self {
            id: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            flags: AudioFlags::from_bits_truncate(u32::from_le_bytes(
                bytes[4..8].try_into().unwrap(),
            )),
            rate: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            channels: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            format: SampleFormat::from_tag(bytes[16])?,
        })
    }
}

/// Header preceding the PCM bytes of one audio packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioDataHeader {
    pub time: u64,
    /// Length of the PCM tail in bytes
    pub size: u64,
    pub id: u32,
}

impl AudioDataHeader {
    pub fn encode(&self, out: &mut [u8]) {
        out[..AUDIO_DATA_HEADER_SIZE].fill(0);
        out[0..8].copy_from_slice(&self.time.to_le_bytes());
        out[8..16].copy_from_slice(&self.size.to_le_bytes());
        out[16..20].copy_from_slice(&self.id.to_le_bytes());
    }

    pub fn to_bytes(&self) -> [u8; AUDIO_DATA_HEADER_SIZE] {
        let mut buf = [0u8; AUDIO_DATA_HEADER_SIZE];
        self.encode(&mut buf);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < AUDIO_DATA_HEADER_SIZE {
            return Err(GlcastError::InvalidArgument("short audio data header"));
        }
        Ok(Self {
            time: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            size: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            id: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
        })
    }
}

/// Color correction state for one video stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorMsg {
    pub id: u32,
    pub brightness: f32,
    pub contrast: f32,
    pub red: f32,
    pub green: f32,
    pub blue: f32,
}

impl ColorMsg {
    pub fn encode(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.id.to_le_bytes());
        out[4..8].copy_from_slice(&self.brightness.to_le_bytes());
        out[8..12].copy_from_slice(&self.contrast.to_le_bytes());
        out[12..16].copy_from_slice(&self.red.to_le_bytes());
        out[16..20].copy_from_slice(&self.green.to_le_bytes());
        out[20..24].copy_from_slice(&self.blue.to_le_bytes());
    }

    pub fn to_bytes(&self) -> [u8; COLOR_MSG_SIZE] {
        let mut buf = [0u8; COLOR_MSG_SIZE];
        self.encode(&mut buf);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < COLOR_MSG_SIZE {
            return Err(GlcastError::InvalidArgument("short color message"));
        }
        Ok(Self {
            id: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            brightness: f32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            contrast: f32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            red: f32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            green: f32::from_le_bytes(bytes[16..20].try_into().unwrap()),
            blue: f32::from_le_bytes(bytes[20..24].try_into().unwrap()),
        })
    }
}

/// Assemble a complete message (header plus payload bytes) into one vector
pub fn assemble(kind: MsgKind, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(MSG_HEADER_SIZE + payload.len());
    out.extend_from_slice(&MsgHeader::new(kind).to_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let hdr = MsgHeader::new(MsgKind::VideoFrame);
        let bytes = hdr.to_bytes();
        assert_eq!(bytes.len(), MSG_HEADER_SIZE);
        assert_eq!(MsgHeader::decode(&bytes).unwrap(), hdr);
    }

    #[test]
    fn test_unknown_tag_carried() {
        let mut bytes = [0u8; MSG_HEADER_SIZE];
        bytes[0] = 0x7f;
        let hdr = MsgHeader::decode(&bytes).unwrap();
        assert_eq!(hdr.kind, MsgKind::Unknown(0x7f));
        assert_eq!(hdr.kind.tag(), 0x7f);
    }

    #[test]
    fn test_video_format_layout() {
        let msg = VideoFormatMsg {
            id: 7,
            flags: VideoFlags::DWORD_ALIGNED,
            width: 1024,
            height: 768,
            format: PixelFormat::Bgra,
        };
        let bytes = msg.to_bytes();
        assert_eq!(&bytes[0..4], &7u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &1024u32.to_le_bytes());
        assert_eq!(bytes[16], 2);
        assert_eq!(VideoFormatMsg::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_frame_size_alignment() {
        // 100 px BGR rows are 300 bytes, padded to 304 when dword aligned
        let aligned = VideoFormatMsg {
            id: 1,
            flags: VideoFlags::DWORD_ALIGNED,
            width: 100,
            height: 10,
            format: PixelFormat::Bgr,
        };
        assert_eq!(aligned.frame_size(), 304 * 10);

        let packed = VideoFormatMsg {
            flags: VideoFlags::empty(),
            ..aligned
        };
        assert_eq!(packed.frame_size(), 300 * 10);

        let planar = VideoFormatMsg {
            format: PixelFormat::Ycbcr420Jpeg,
            ..packed
        };
        assert_eq!(planar.frame_size(), 100 * 10 * 3 / 2);
    }

    #[test]
    fn test_bad_format_tag_rejected() {
        let mut bytes = VideoFormatMsg {
            id: 1,
            flags: VideoFlags::empty(),
            width: 1,
            height: 1,
            format: PixelFormat::Bgr,
        }
        .to_bytes();
        bytes[16] = 99;
        assert!(matches!(
            VideoFormatMsg::decode(&bytes),
            Err(GlcastError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_color_round_trip() {
        let msg = ColorMsg {
            id: 3,
            brightness: 0.0,
            contrast: 0.0,
            red: 1.2,
            green: 1.0,
            blue: 0.8,
        };
        assert_eq!(ColorMsg::decode(&msg.to_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_audio_data_header() {
        let hdr = AudioDataHeader {
            time: 123_456_789,
            size: 4096,
            id: 2,
        };
        let decoded = AudioDataHeader::decode(&hdr.to_bytes()).unwrap();
        assert_eq!(decoded, hdr);
    }
}

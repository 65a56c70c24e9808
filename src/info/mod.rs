//! Stream information printer
//!
//! A read-only consumer stage that pretty-prints pipeline traffic to any
//! writer at a configurable detail level and reports per-stream totals
//! when the stream drains. Useful for inspecting a capture without
//! attaching a real sink.

use crate::error::{GlcastError, Result};
use crate::message::{
    AudioDataHeader, AudioFormatMsg, ColorMsg, FrameHeader, MsgHeader, MsgKind, PixelFormat,
    SampleFormat, VideoFlags, VideoFormatMsg,
};
use crate::runner::{ReadAction, Stage};
use parking_lot::Mutex;
use std::io::Write;
use tracing::error;

const DETAIL_VIDEO: u32 = 2;
const DETAIL_AUDIO_FORMAT: u32 = 2;
const DETAIL_FPS: u32 = 3;
const DETAIL_AUDIO: u32 = 4;
const DETAIL_AUDIO_DATA: u32 = 5;
const DETAIL_FRAME: u32 = 5;
const DETAIL_FRAME_FULL: u32 = 6;

struct VideoInfo {
    id: u32,
    flags: VideoFlags,
    format: Option<PixelFormat>,
    w: u32,
    h: u32,
    frames: u64,
    bytes: u64,
    fps_frames: u64,
    last_fps_time: u64,
    fps_time: u64,
}

struct AudioInfo {
    id: u32,
    packets: u64,
    bytes: u64,
}

struct Inner<W> {
    sink: W,
    time: u64,
    video: Vec<VideoInfo>,
    audio: Vec<AudioInfo>,
}

/// Read-only stage printing stream traffic and totals
pub struct InfoPrinter<W: Write + Send + 'static> {
    level: u32,
    inner: Mutex<Inner<W>>,
}

impl<W: Write + Send + 'static> InfoPrinter<W> {
    /// Create a printer at the given detail level (1 = stream summary,
    /// 6 = every frame) writing to `sink`
    pub fn new(level: u32, sink: W) -> Result<Self> {
        if level < 1 {
            return Err(GlcastError::InvalidArgument("detail level must be >= 1"));
        }
        Ok(Self {
            level,
            inner: Mutex::new(Inner {
                sink,
                time: 0,
                video: Vec::new(),
                audio: Vec::new(),
            }),
        })
    }
}

fn print_time<W: Write>(sink: &mut W, time: u64) -> std::io::Result<()> {
    write!(sink, "[{:7.2}s] ", time as f64 / 1_000_000_000.0)
}

fn print_bytes<W: Write>(sink: &mut W, bytes: u64) -> std::io::Result<()> {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;
    if bytes >= GIB {
        writeln!(sink, "{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        writeln!(sink, "{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        writeln!(sink, "{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        writeln!(sink, "{bytes} B")
    }
}

impl<W: Write> Inner<W> {
    fn video_info(&mut self, id: u32) -> &mut VideoInfo {
        if let Some(i) = self.video.iter().position(|v| v.id == id) {
            return &mut self.video[i];
        }
        self.video.push(VideoInfo {
            id,
            flags: VideoFlags::empty(),
            format: None,
            w: 0,
            h: 0,
            frames: 0,
            bytes: 0,
            fps_frames: 0,
            last_fps_time: 0,
            fps_time: 0,
        });
        self.video.last_mut().unwrap()
    }

    fn audio_info(&mut self, id: u32) -> &mut AudioInfo {
        if let Some(i) = self.audio.iter().position(|a| a.id == id) {
            return &mut self.audio[i];
        }
        self.audio.push(AudioInfo {
            id,
            packets: 0,
            bytes: 0,
        });
        self.audio.last_mut().unwrap()
    }

    fn video_format(&mut self, level: u32, msg: &VideoFormatMsg) -> std::io::Result<()> {
        let info = self.video_info(msg.id);
        info.w = msg.width;
        info.h = msg.height;
        info.flags = msg.flags;
        info.format = Some(msg.format);

        let time = self.time;
        print_time(&mut self.sink, time)?;
        if level >= DETAIL_VIDEO {
            writeln!(self.sink, "video stream format message")?;
            writeln!(self.sink, "  stream id   = {}", msg.id)?;
            writeln!(self.sink, "  format      = {:?}", msg.format)?;
            writeln!(self.sink, "  flags       = {:?}", msg.flags)?;
            writeln!(self.sink, "  width       = {}", msg.width)?;
            writeln!(self.sink, "  height      = {}", msg.height)
        } else {
            writeln!(self.sink, "video stream {}", msg.id)
        }
    }

    fn video_frame(&mut self, level: u32, hdr: &FrameHeader, payload_len: u64) -> std::io::Result<()> {
        self.time = hdr.time;
        let time = self.time;
        let info = self.video_info(hdr.id);
        info.frames += 1;
        info.fps_frames += 1;
        info.bytes += payload_len;

        let (w, h, id) = (info.w, info.h, info.id);
        if level >= DETAIL_FRAME_FULL {
            print_time(&mut self.sink, time)?;
            writeln!(self.sink, "frame")?;
            writeln!(self.sink, "  stream id   = {}", hdr.id)?;
            writeln!(self.sink, "  time        = {}", hdr.time)?;
            writeln!(self.sink, "  size        = {w}x{h}")?;
        } else if level >= DETAIL_FRAME {
            print_time(&mut self.sink, time)?;
            writeln!(self.sink, "frame (video {})", hdr.id)?;
        }

        if level >= DETAIL_FPS {
            let info = self.video_info(id);
            if hdr.time.saturating_sub(info.fps_time) >= 1_000_000_000 {
                let frames = info.fps_frames;
                let span = hdr.time - info.last_fps_time;
                info.last_fps_time = hdr.time;
                info.fps_time += 1_000_000_000;
                info.fps_frames = 0;
                print_time(&mut self.sink, time)?;
                writeln!(
                    self.sink,
                    "video {id}: {:.2} fps",
                    frames as f64 * 1_000_000_000.0 / span.max(1) as f64
                )?;
            }
        }
        Ok(())
    }

    fn audio_format(&mut self, level: u32, msg: &AudioFormatMsg) -> std::io::Result<()> {
        let time = self.time;
        print_time(&mut self.sink, time)?;
        if level >= DETAIL_AUDIO_FORMAT {
            writeln!(self.sink, "audio stream format message")?;
            writeln!(self.sink, "  stream id   = {}", msg.id)?;
            let format = match msg.format {
                SampleFormat::S16Le => "signed 16bit LE",
                SampleFormat::S24Le => "signed 24bit LE",
                SampleFormat::S32Le => "signed 32bit LE",
            };
            writeln!(self.sink, "  format      = {format}")?;
            writeln!(self.sink, "  flags       = {:?}", msg.flags)?;
            writeln!(self.sink, "  rate        = {}", msg.rate)?;
            writeln!(self.sink, "  channels    = {}", msg.channels)
        } else {
            writeln!(self.sink, "audio stream {}", msg.id)
        }
    }

    fn audio_data(&mut self, level: u32, hdr: &AudioDataHeader) -> std::io::Result<()> {
        self.time = hdr.time;
        let time = self.time;
        let info = self.audio_info(hdr.id);
        info.packets += 1;
        info.bytes += hdr.size;

        if level >= DETAIL_AUDIO_DATA {
            print_time(&mut self.sink, time)?;
            writeln!(self.sink, "audio packet")?;
            writeln!(self.sink, "  stream id   = {}", hdr.id)?;
            writeln!(self.sink, "  time        = {}", hdr.time)?;
            writeln!(self.sink, "  size        = {}", hdr.size)
        } else if level >= DETAIL_AUDIO {
            print_time(&mut self.sink, time)?;
            writeln!(self.sink, "audio packet (stream {})", hdr.id)
        } else {
            Ok(())
        }
    }

    fn color(&mut self, level: u32, msg: &ColorMsg) -> std::io::Result<()> {
        let time = self.time;
        print_time(&mut self.sink, time)?;
        if level >= DETAIL_VIDEO {
            writeln!(self.sink, "color correction message")?;
            writeln!(self.sink, "  stream id   = {}", msg.id)?;
            writeln!(self.sink, "  brightness  = {}", msg.brightness)?;
            writeln!(self.sink, "  contrast    = {}", msg.contrast)?;
            writeln!(self.sink, "  red gamma   = {}", msg.red)?;
            writeln!(self.sink, "  green gamma = {}", msg.green)?;
            writeln!(self.sink, "  blue gamma  = {}", msg.blue)
        } else {
            writeln!(self.sink, "color correction information for video {}", msg.id)
        }
    }

    fn totals(&mut self) -> std::io::Result<()> {
        let seconds = (self.time as f64 / 1_000_000_000.0).max(f64::MIN_POSITIVE);
        let video = std::mem::take(&mut self.video);
        for info in video {
            writeln!(self.sink, "video stream {}", info.id)?;
            writeln!(self.sink, "  frames      = {}", info.frames)?;
            writeln!(self.sink, "  fps         = {:05.2}", info.frames as f64 / seconds)?;
            write!(self.sink, "  bytes       = ")?;
            print_bytes(&mut self.sink, info.bytes)?;
            write!(self.sink, "  bps         = ")?;
            print_bytes(&mut self.sink, (info.bytes as f64 / seconds) as u64)?;
        }
        let audio = std::mem::take(&mut self.audio);
        for info in audio {
            writeln!(self.sink, "audio stream {}", info.id)?;
            writeln!(self.sink, "  packets     = {}", info.packets)?;
            writeln!(self.sink, "  pps         = {:05.2}", info.packets as f64 / seconds)?;
            write!(self.sink, "  bytes       = ")?;
            print_bytes(&mut self.sink, info.bytes)?;
            write!(self.sink, "  bps         = ")?;
            print_bytes(&mut self.sink, (info.bytes as f64 / seconds) as u64)?;
        }
        Ok(())
    }
}

impl<W: Write + Send + 'static> Stage for InfoPrinter<W> {
    type Job = ();

    fn read(&self, header: &MsgHeader, payload: &[u8]) -> Result<ReadAction<()>> {
        let mut inner = self.inner.lock();
        let level = self.level;
        match header.kind {
            MsgKind::VideoFormat => {
                let msg = VideoFormatMsg::decode(payload)?;
                inner.video_format(level, &msg)?;
            }
            MsgKind::VideoFrame => {
                let hdr = FrameHeader::decode(payload)?;
                let len = (payload.len() - crate::message::FRAME_HEADER_SIZE) as u64;
                inner.video_frame(level, &hdr, len)?;
            }
            MsgKind::AudioFormat => {
                let msg = AudioFormatMsg::decode(payload)?;
                inner.audio_format(level, &msg)?;
            }
            MsgKind::AudioData => {
                let hdr = AudioDataHeader::decode(payload)?;
                inner.audio_data(level, &hdr)?;
            }
            MsgKind::Color => {
                let msg = ColorMsg::decode(payload)?;
                inner.color(level, &msg)?;
            }
            MsgKind::Close => {
                let time = inner.time;
                print_time(&mut inner.sink, time)?;
                writeln!(inner.sink, "end of stream")?;
            }
            MsgKind::Unknown(tag) => {
                let time = inner.time;
                print_time(&mut inner.sink, time)?;
                writeln!(
                    inner.sink,
                    "error: unknown {} B message with type {tag:#04x}",
                    payload.len()
                )?;
            }
        }
        Ok(ReadAction::Copy)
    }

    fn finish(&self, err: Option<&GlcastError>) {
        if let Some(err) = err {
            error!("info stage failed: {err}");
        }
        let mut inner = self.inner.lock();
        if let Err(err) = inner.totals() {
            error!("can't write stream totals: {err}");
        }
        let _ = inner.sink.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::AudioFlags;
    use std::sync::Arc;

    /// Shared byte sink the test can inspect after the stage finishes
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn feed(printer: &InfoPrinter<SharedSink>, kind: MsgKind, payload: &[u8]) {
        printer.read(&MsgHeader::new(kind), payload).unwrap();
    }

    #[test]
    fn test_summary_and_totals() {
        let sink = SharedSink::default();
        let printer = InfoPrinter::new(1, sink.clone()).unwrap();

        feed(
            &printer,
            MsgKind::VideoFormat,
            &VideoFormatMsg {
                id: 1,
                flags: VideoFlags::empty(),
                width: 4,
                height: 4,
                format: PixelFormat::Bgr,
            }
            .to_bytes(),
        );
        let mut frame = FrameHeader {
            time: 2_000_000_000,
            id: 1,
        }
        .to_bytes()
        .to_vec();
        frame.extend_from_slice(&[0u8; 48]);
        feed(&printer, MsgKind::VideoFrame, &frame);
        feed(
            &printer,
            MsgKind::AudioFormat,
            &AudioFormatMsg {
                id: 2,
                flags: AudioFlags::INTERLEAVED,
                rate: 44_100,
                channels: 2,
                format: SampleFormat::S16Le,
            }
            .to_bytes(),
        );
        feed(&printer, MsgKind::Close, &[]);
        printer.finish(None);

        let out = String::from_utf8(sink.0.lock().clone()).unwrap();
        assert!(out.contains("video stream 1"));
        assert!(out.contains("audio stream 2"));
        assert!(out.contains("end of stream"));
        assert!(out.contains("frames      = 1"));
        assert!(out.contains("48 B"));
    }

    #[test]
    fn test_detailed_video_format() {
        let sink = SharedSink::default();
        let printer = InfoPrinter::new(2, sink.clone()).unwrap();
        feed(
            &printer,
            MsgKind::VideoFormat,
            &VideoFormatMsg {
                id: 5,
                flags: VideoFlags::DWORD_ALIGNED,
                width: 1024,
                height: 768,
                format: PixelFormat::Bgra,
            }
            .to_bytes(),
        );
        let out = String::from_utf8(sink.0.lock().clone()).unwrap();
        assert!(out.contains("width       = 1024"));
        assert!(out.contains("DWORD_ALIGNED"));
    }

    #[test]
    fn test_unknown_message_reported() {
        let sink = SharedSink::default();
        let printer = InfoPrinter::new(1, sink.clone()).unwrap();
        printer
            .read(&MsgHeader::new(MsgKind::Unknown(0x42)), &[0u8; 10])
            .unwrap();
        let out = String::from_utf8(sink.0.lock().clone()).unwrap();
        assert!(out.contains("unknown 10 B message with type 0x42"));
    }

    #[test]
    fn test_zero_level_rejected() {
        assert!(InfoPrinter::new(0, std::io::sink()).is_err());
    }
}

//! Uncompressed AVI muxing: RGB24 video plus mono 16-bit PCM audio.

use std::io::Write;

use super::{EncoderBackend, EncoderFormat, Recording, RecordingEncoder, StreamSpec};
use crate::{render::RasterSurface, MotifError, Result};

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
const VIDEO_CHUNK: &[u8; 4] = b"00db";
const AUDIO_CHUNK: &[u8; 4] = b"01wb";

/// Built-in backend. Only produces [`EncoderFormat::AviRaw`] and is always
/// available.
#[derive(Debug, Default, Clone, Copy)]
pub struct AviBackend;

impl EncoderBackend for AviBackend {
    fn name(&self) -> &str {
        "avi"
    }

    fn supports(&self, format: EncoderFormat) -> bool {
        format == EncoderFormat::AviRaw
    }

    fn open(&self, format: EncoderFormat, spec: &StreamSpec) -> Result<Box<dyn RecordingEncoder>> {
        if !self.supports(format) {
            return Err(MotifError::Encode(format!("avi backend cannot produce {format}")));
        }
        Ok(Box::new(AviWriter::new(*spec)))
    }
}

/// Collects interleaved chunks in memory and lays out the file on finish.
#[derive(Debug)]
pub struct AviWriter {
    spec: StreamSpec,
    chunks: Vec<([u8; 4], Vec<u8>)>,
    frames: u64,
    samples: u64,
}

impl AviWriter {
    pub fn new(spec: StreamSpec) -> Self {
        Self {
            spec,
            chunks: Vec::new(),
            frames: 0,
            samples: 0,
        }
    }

    fn row_stride(&self) -> usize {
        (self.spec.width as usize * 3 + 3) & !3
    }

    fn frame_bytes(&self) -> usize {
        self.row_stride() * self.spec.height as usize
    }

    fn write_file(&self) -> std::io::Result<Vec<u8>> {
        let spec = self.spec;
        let max_audio = self
            .chunks
            .iter()
            .filter(|(id, _)| id == AUDIO_CHUNK)
            .map(|(_, data)| data.len())
            .max()
            .unwrap_or(0);
        let suggested = dword(self.frame_bytes().max(max_audio));

        let mut avih = Vec::with_capacity(56);
        avih.write_all(&(1_000_000 / spec.fps.max(1)).to_le_bytes())?;
        let max_bytes_per_sec = dword(self.frame_bytes())
            .saturating_mul(spec.fps)
            .saturating_add(spec.sample_rate.saturating_mul(2));
        avih.write_all(&max_bytes_per_sec.to_le_bytes())?;
        avih.write_all(&0u32.to_le_bytes())?;
        avih.write_all(&AVIF_HASINDEX.to_le_bytes())?;
        avih.write_all(&dword(self.frames).to_le_bytes())?;
        avih.write_all(&0u32.to_le_bytes())?;
        avih.write_all(&2u32.to_le_bytes())?;
        avih.write_all(&suggested.to_le_bytes())?;
        avih.write_all(&spec.width.to_le_bytes())?;
        avih.write_all(&spec.height.to_le_bytes())?;
        avih.write_all(&[0u8; 16])?;

        let video_strh = stream_header(
            b"vids",
            b"DIB ",
            1,
            spec.fps,
            dword(self.frames),
            dword(self.frame_bytes()),
            0,
            (spec.width as u16, spec.height as u16),
        )?;
        let mut video_strf = Vec::with_capacity(40);
        video_strf.write_all(&40u32.to_le_bytes())?;
        video_strf.write_all(&(spec.width as i32).to_le_bytes())?;
        // Positive height: rows are stored bottom-up.
        video_strf.write_all(&(spec.height as i32).to_le_bytes())?;
        video_strf.write_all(&1u16.to_le_bytes())?;
        video_strf.write_all(&24u16.to_le_bytes())?;
        video_strf.write_all(&0u32.to_le_bytes())?;
        video_strf.write_all(&dword(self.frame_bytes()).to_le_bytes())?;
        video_strf.write_all(&[0u8; 16])?;

        let audio_strh = stream_header(
            b"auds",
            &[0; 4],
            1,
            spec.sample_rate,
            dword(self.samples),
            dword(max_audio),
            2,
            (0, 0),
        )?;
        let mut audio_strf = Vec::with_capacity(18);
        audio_strf.write_all(&1u16.to_le_bytes())?;
        audio_strf.write_all(&1u16.to_le_bytes())?;
        audio_strf.write_all(&spec.sample_rate.to_le_bytes())?;
        audio_strf.write_all(&spec.sample_rate.saturating_mul(2).to_le_bytes())?;
        audio_strf.write_all(&2u16.to_le_bytes())?;
        audio_strf.write_all(&16u16.to_le_bytes())?;
        audio_strf.write_all(&0u16.to_le_bytes())?;

        let video_strl = list(b"strl", &[chunk(b"strh", &video_strh), chunk(b"strf", &video_strf)]);
        let audio_strl = list(b"strl", &[chunk(b"strh", &audio_strh), chunk(b"strf", &audio_strf)]);
        let hdrl = list(b"hdrl", &[chunk(b"avih", &avih), video_strl, audio_strl]);

        // Index offsets are relative to the 'movi' fourcc.
        let mut movi_chunks = Vec::with_capacity(self.chunks.len());
        let mut idx1 = Vec::with_capacity(self.chunks.len() * 16);
        let mut offset = 4u32;
        for (id, data) in &self.chunks {
            let encoded = chunk(id, data);
            idx1.write_all(id)?;
            let flags = if id == VIDEO_CHUNK { AVIIF_KEYFRAME } else { 0 };
            idx1.write_all(&flags.to_le_bytes())?;
            idx1.write_all(&offset.to_le_bytes())?;
            idx1.write_all(&dword(data.len()).to_le_bytes())?;
            offset = offset.saturating_add(dword(encoded.len()));
            movi_chunks.push(encoded);
        }
        let movi = list(b"movi", &movi_chunks);

        let mut body = Vec::new();
        body.write_all(b"AVI ")?;
        body.write_all(&hdrl)?;
        body.write_all(&movi)?;
        body.write_all(&chunk(b"idx1", &idx1))?;

        let mut file = Vec::with_capacity(body.len() + 8);
        file.write_all(b"RIFF")?;
        file.write_all(&dword(body.len()).to_le_bytes())?;
        file.write_all(&body)?;
        Ok(file)
    }
}

/// RIFF size fields are 32 bits; anything larger is pinned at the maximum.
fn dword<T: TryInto<u32>>(value: T) -> u32 {
    value.try_into().unwrap_or(u32::MAX)
}

impl RecordingEncoder for AviWriter {
    fn push_frame(&mut self, frame: &RasterSurface) -> Result<()> {
        if frame.width() != self.spec.width || frame.height() != self.spec.height {
            return Err(MotifError::Encode(format!(
                "frame is {}x{}, stream is {}x{}",
                frame.width(),
                frame.height(),
                self.spec.width,
                self.spec.height
            )));
        }
        let stride = self.row_stride();
        let width = self.spec.width as usize;
        let mut data = vec![0u8; self.frame_bytes()];
        for (row, src) in frame.pixels().chunks_exact(width * 3).rev().enumerate() {
            let dst = &mut data[row * stride..row * stride + width * 3];
            for (out, px) in dst.chunks_exact_mut(3).zip(src.chunks_exact(3)) {
                out.copy_from_slice(&[px[2], px[1], px[0]]);
            }
        }
        self.chunks.push((*VIDEO_CHUNK, data));
        self.frames += 1;
        Ok(())
    }

    fn push_audio(&mut self, samples: &[f32]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut data = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            data.extend_from_slice(&value.to_le_bytes());
        }
        self.chunks.push((*AUDIO_CHUNK, data));
        self.samples += samples.len() as u64;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Recording> {
        let bytes = self.write_file()?;
        tracing::debug!(
            frames = self.frames,
            samples = self.samples,
            bytes = bytes.len(),
            "avi recording finished"
        );
        Ok(Recording {
            bytes,
            format: EncoderFormat::AviRaw,
            video_frames: self.frames,
            audio_samples: self.samples,
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn stream_header(
    kind: &[u8; 4],
    handler: &[u8; 4],
    scale: u32,
    rate: u32,
    length: u32,
    suggested_buffer: u32,
    sample_size: u32,
    frame: (u16, u16),
) -> std::io::Result<Vec<u8>> {
    let mut strh = Vec::with_capacity(56);
    strh.write_all(kind)?;
    strh.write_all(handler)?;
    strh.write_all(&0u32.to_le_bytes())?;
    strh.write_all(&0u16.to_le_bytes())?;
    strh.write_all(&0u16.to_le_bytes())?;
    strh.write_all(&0u32.to_le_bytes())?;
    strh.write_all(&scale.to_le_bytes())?;
    strh.write_all(&rate.to_le_bytes())?;
    strh.write_all(&0u32.to_le_bytes())?;
    strh.write_all(&length.to_le_bytes())?;
    strh.write_all(&suggested_buffer.to_le_bytes())?;
    strh.write_all(&u32::MAX.to_le_bytes())?;
    strh.write_all(&sample_size.to_le_bytes())?;
    for edge in [0, 0, frame.0, frame.1] {
        strh.write_all(&edge.to_le_bytes())?;
    }
    Ok(strh)
}

fn chunk(id: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 9);
    out.extend_from_slice(id);
    out.extend_from_slice(&dword(data.len()).to_le_bytes());
    out.extend_from_slice(data);
    if data.len() % 2 == 1 {
        out.push(0);
    }
    out
}

fn list(kind: &[u8; 4], children: &[Vec<u8>]) -> Vec<u8> {
    let size: usize = 4 + children.iter().map(Vec::len).sum::<usize>();
    let mut out = Vec::with_capacity(size + 8);
    out.extend_from_slice(b"LIST");
    out.extend_from_slice(&dword(size).to_le_bytes());
    out.extend_from_slice(kind);
    for child in children {
        out.extend_from_slice(child);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_at(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    fn find(bytes: &[u8], needle: &[u8]) -> usize {
        bytes
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap_or_else(|| panic!("{:?} not found", String::from_utf8_lossy(needle)))
    }

    fn spec() -> StreamSpec {
        StreamSpec {
            width: 5,
            height: 4,
            fps: 10,
            sample_rate: 1_000,
        }
    }

    #[test]
    fn writes_riff_structure() {
        let mut writer = Box::new(AviWriter::new(spec()));
        let frame = RasterSurface::background(5, 4);
        for _ in 0..3 {
            writer.push_frame(&frame).unwrap();
            writer.push_audio(&[0.5; 100]).unwrap();
        }
        let recording = writer.finish().unwrap();
        let bytes = &recording.bytes;

        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(u32_at(bytes, 4) as usize, bytes.len() - 8);
        assert_eq!(&bytes[8..12], b"AVI ");
        assert_eq!(&bytes[12..16], b"LIST");
        assert_eq!(&bytes[20..24], b"hdrl");

        let avih = find(bytes, b"avih");
        assert_eq!(u32_at(bytes, avih + 4), 56);
        assert_eq!(u32_at(bytes, avih + 8), 100_000);
        assert_eq!(u32_at(bytes, avih + 24), 3);
        assert_eq!(u32_at(bytes, avih + 32), 2);
        assert_eq!(u32_at(bytes, avih + 40), 5);
        assert_eq!(u32_at(bytes, avih + 44), 4);

        assert!(find(bytes, b"vids") < find(bytes, b"auds"));
        let movi = find(bytes, b"movi");
        assert_eq!(&bytes[movi + 4..movi + 8], VIDEO_CHUNK);
        // 5 px * 3 bytes padded to 16 per row.
        assert_eq!(u32_at(bytes, movi + 8), 64);

        let idx1 = find(bytes, b"idx1");
        assert_eq!(u32_at(bytes, idx1 + 4), 6 * 16);
        assert_eq!(idx1 + 8 + 6 * 16, bytes.len());
        assert_eq!(u32_at(bytes, idx1 + 16), 4);

        assert_eq!(recording.video_frames, 3);
        assert_eq!(recording.audio_samples, 300);
        assert_eq!(recording.format, EncoderFormat::AviRaw);
    }

    #[test]
    fn stores_rows_bottom_up_as_bgr() {
        let mut surface = RasterSurface::new(2, 2);
        surface.put_pixel(0, 0, [1, 2, 3]);
        surface.put_pixel(0, 1, [4, 5, 6]);

        let mut writer = AviWriter::new(StreamSpec {
            width: 2,
            height: 2,
            ..spec()
        });
        writer.push_frame(&surface).unwrap();
        let data = &writer.chunks[0].1;
        assert_eq!(data.len(), 16);
        assert_eq!(&data[0..3], &[6, 5, 4]);
        assert_eq!(&data[8..11], &[3, 2, 1]);
    }

    #[test]
    fn rejects_mismatched_frames_and_formats() {
        let mut writer = AviWriter::new(spec());
        assert!(writer.push_frame(&RasterSurface::new(6, 4)).is_err());
        assert!(AviBackend.open(EncoderFormat::Mp4H264Aac, &spec()).is_err());
        assert!(AviBackend.supports(EncoderFormat::AviRaw));
    }

    #[test]
    fn clamps_audio_samples() {
        let mut writer = AviWriter::new(spec());
        writer.push_audio(&[2.0, -2.0, 0.0]).unwrap();
        let data = &writer.chunks[0].1;
        assert_eq!(i16::from_le_bytes([data[0], data[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([data[2], data[3]]), -i16::MAX);
        assert_eq!(i16::from_le_bytes([data[4], data[5]]), 0);
    }

    #[test]
    fn huge_frames_pin_header_rates() {
        let writer = AviWriter::new(StreamSpec {
            width: 20_000,
            height: 20_000,
            fps: 60,
            sample_rate: 48_000,
        });
        let bytes = writer.write_file().unwrap();
        let avih = find(&bytes, b"avih") + 8;
        let max_bytes_per_sec = u32::from_le_bytes(bytes[avih + 4..avih + 8].try_into().unwrap());
        assert_eq!(max_bytes_per_sec, u32::MAX);
        let suggested = u32::from_le_bytes(bytes[avih + 28..avih + 32].try_into().unwrap());
        assert_eq!(suggested, 60_000 * 20_000);
    }
}

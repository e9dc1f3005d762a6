//! Drawing capability shared by the live view and the export surface.

use std::f32::consts::{FRAC_PI_2, TAU};

use serde::{Deserialize, Serialize};

use crate::mapping::PitchId;

mod font;

/// Number of nodes on the circle, one per pitch class.
pub const NODE_COUNT: usize = 12;

pub type Rgb = [u8; 3];

const BACKGROUND: Rgb = [12, 14, 24];
const RING: Rgb = [48, 52, 72];
const NODE_IDLE: Rgb = [70, 76, 100];
const CAPTION: Rgb = [235, 235, 235];

/// Visual channel a trail belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Melody,
    Harmony,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Melody, Channel::Harmony];

    fn color(self) -> Rgb {
        match self {
            Channel::Melody => [255, 196, 87],
            Channel::Harmony => [110, 180, 255],
        }
    }
}

/// What the visual sync loop needs from a drawing surface. `strength` is in
/// `0.0..=1.0`, 1.0 meaning fully lit.
pub trait Renderer {
    fn begin_frame(&mut self) {}
    fn draw_segment(&mut self, channel: Channel, from: usize, to: usize, strength: f32);
    fn draw_node(&mut self, channel: Channel, node: usize, strength: f32);
    fn draw_caption(&mut self, text: &str);
    fn end_frame(&mut self) {}
}

impl<R: Renderer + ?Sized> Renderer for Box<R> {
    fn begin_frame(&mut self) {
        (**self).begin_frame();
    }

    fn draw_segment(&mut self, channel: Channel, from: usize, to: usize, strength: f32) {
        (**self).draw_segment(channel, from, to, strength);
    }

    fn draw_node(&mut self, channel: Channel, node: usize, strength: f32) {
        (**self).draw_node(channel, node, strength);
    }

    fn draw_caption(&mut self, text: &str) {
        (**self).draw_caption(text);
    }

    fn end_frame(&mut self) {
        (**self).end_frame();
    }
}

/// Node index of a pitch: pitch classes ordered around the circle of fifths.
pub fn node_for(pitch: PitchId) -> usize {
    (pitch.pitch_class() as usize * 7) % NODE_COUNT
}

/// Geometry of the node circle on a surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircleLayout {
    pub cx: f32,
    pub cy: f32,
    pub radius: f32,
}

impl CircleLayout {
    /// Centers the circle in the upper part of a surface, leaving a caption
    /// band at the bottom.
    pub fn fitted(width: u32, height: u32) -> Self {
        let w = width as f32;
        let h = height as f32 * 0.85;
        Self {
            cx: w / 2.0,
            cy: h / 2.0,
            radius: w.min(h) * 0.38,
        }
    }

    /// Node 0 sits at twelve o'clock; indices run clockwise.
    pub fn node_position(&self, node: usize) -> (f32, f32) {
        let angle = -FRAC_PI_2 + (node % NODE_COUNT) as f32 * TAU / NODE_COUNT as f32;
        (
            self.cx + self.radius * angle.cos(),
            self.cy + self.radius * angle.sin(),
        )
    }

    fn node_radius(&self) -> f32 {
        (self.radius * 0.09).max(1.5)
    }
}

/// RGB24 frame buffer, row-major from the top-left corner.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterSurface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    layout: CircleLayout,
}

impl RasterSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 3],
            layout: CircleLayout::fitted(width, height),
        }
    }

    /// The static layer every frame is composited on: backdrop, ring and idle
    /// nodes.
    pub fn background(width: u32, height: u32) -> Self {
        let mut surface = Self::new(width, height);
        surface.fill(BACKGROUND);
        let layout = surface.layout;
        let steps = (layout.radius * TAU).ceil().max(12.0) as usize;
        for step in 0..steps {
            let angle = step as f32 * TAU / steps as f32;
            surface.blend(
                layout.cx + layout.radius * angle.cos(),
                layout.cy + layout.radius * angle.sin(),
                RING,
                1.0,
            );
        }
        for node in 0..NODE_COUNT {
            let (x, y) = layout.node_position(node);
            surface.disc(x, y, layout.node_radius(), NODE_IDLE, 1.0);
        }
        surface
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn layout(&self) -> CircleLayout {
        self.layout
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 3;
        Some([self.pixels[i], self.pixels[i + 1], self.pixels[i + 2]])
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, color: Rgb) {
        if x < self.width && y < self.height {
            let i = (y as usize * self.width as usize + x as usize) * 3;
            self.pixels[i..i + 3].copy_from_slice(&color);
        }
    }

    pub fn fill(&mut self, color: Rgb) {
        for px in self.pixels.chunks_exact_mut(3) {
            px.copy_from_slice(&color);
        }
    }

    /// Copies another surface of the same size underneath everything drawn
    /// next.
    pub fn composite(&mut self, layer: &RasterSurface) {
        if layer.pixels.len() == self.pixels.len() {
            self.pixels.copy_from_slice(&layer.pixels);
        }
    }

    fn blend(&mut self, x: f32, y: f32, color: Rgb, alpha: f32) {
        if x < 0.0 || y < 0.0 {
            return;
        }
        let (x, y) = (x as u32, y as u32);
        if x >= self.width || y >= self.height {
            return;
        }
        let alpha = alpha.clamp(0.0, 1.0);
        let i = (y as usize * self.width as usize + x as usize) * 3;
        for (channel, target) in self.pixels[i..i + 3].iter_mut().zip(color) {
            let mixed = *channel as f32 + (target as f32 - *channel as f32) * alpha;
            *channel = mixed.round() as u8;
        }
    }

    fn line(&mut self, from: (f32, f32), to: (f32, f32), color: Rgb, alpha: f32) {
        let (dx, dy) = (to.0 - from.0, to.1 - from.1);
        let steps = dx.abs().max(dy.abs()).ceil().max(1.0) as usize;
        for step in 0..=steps {
            let t = step as f32 / steps as f32;
            self.blend(from.0 + dx * t, from.1 + dy * t, color, alpha);
        }
    }

    fn disc(&mut self, cx: f32, cy: f32, radius: f32, color: Rgb, alpha: f32) {
        let r = radius.ceil() as i32;
        for oy in -r..=r {
            for ox in -r..=r {
                if (ox * ox + oy * oy) as f32 <= radius * radius {
                    self.blend(cx + ox as f32, cy + oy as f32, color, alpha);
                }
            }
        }
    }

    /// Draws text with the built-in 3x5 font, keeping the tail of the text
    /// when it is wider than the surface.
    fn text(&mut self, text: &str, color: Rgb) {
        let scale = (self.height / 120).max(1);
        let advance = 4 * scale;
        let fits = (self.width.saturating_sub(2 * scale) / advance).max(1) as usize;
        let chars: Vec<char> = text.chars().collect();
        let visible = &chars[chars.len().saturating_sub(fits)..];

        let total = visible.len() as u32 * advance;
        let left = self.width.saturating_sub(total) / 2;
        let top = self.height.saturating_sub(7 * scale);
        for (index, ch) in visible.iter().enumerate() {
            let Some(rows) = font::glyph(*ch) else {
                continue;
            };
            let x0 = left + index as u32 * advance;
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..3u32 {
                    if bits & (0b100 >> col) == 0 {
                        continue;
                    }
                    for sy in 0..scale {
                        for sx in 0..scale {
                            let x = x0 + col * scale + sx;
                            let y = top + row as u32 * scale + sy;
                            self.blend(x as f32, y as f32, color, 1.0);
                        }
                    }
                }
            }
        }
    }
}

impl Renderer for RasterSurface {
    fn draw_segment(&mut self, channel: Channel, from: usize, to: usize, strength: f32) {
        let a = self.layout.node_position(from);
        let b = self.layout.node_position(to);
        self.line(a, b, channel.color(), strength);
    }

    fn draw_node(&mut self, channel: Channel, node: usize, strength: f32) {
        let (x, y) = self.layout.node_position(node);
        let radius = self.layout.node_radius() * 1.3;
        self.disc(x, y, radius, channel.color(), strength);
    }

    fn draw_caption(&mut self, text: &str) {
        self.text(text, CAPTION);
    }
}

/// Live view for terminals: logs the caption whenever it grows.
#[derive(Debug, Default)]
pub struct TraceRenderer {
    caption: String,
    lit: usize,
    frames: u64,
}

impl TraceRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl Renderer for TraceRenderer {
    fn begin_frame(&mut self) {
        self.lit = 0;
    }

    fn draw_segment(&mut self, _channel: Channel, _from: usize, _to: usize, _strength: f32) {}

    fn draw_node(&mut self, _channel: Channel, _node: usize, strength: f32) {
        if strength > 0.0 {
            self.lit += 1;
        }
    }

    fn draw_caption(&mut self, text: &str) {
        if text != self.caption {
            self.caption = text.to_string();
            tracing::info!(caption = %self.caption, lit = self.lit, "caption");
        }
    }

    fn end_frame(&mut self) {
        self.frames += 1;
    }
}

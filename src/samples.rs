use std::ops::Range;

use glam::{UVec2, Vec2, Vec4};

use crate::error::{ReconError, ReconResult};
use crate::film::ImageSink;

mod channel;
mod normals;

pub use channel::{ChannelData, ChannelId, ChannelKind, ChannelType};

pub const PRIMARY_HIT: &str = "PRIMARY_HIT";
pub const PRIMARY_NORMAL: &str = "PRIMARY_NORMAL";
pub const SECONDARY_HIT: &str = "SECONDARY_HIT";
pub const SECONDARY_NORMAL: &str = "SECONDARY_NORMAL";
pub const ALBEDO: &str = "ALBEDO";
pub const AMBIENT_OCCLUSION: &str = "AMBIENT_OCCLUSION";
pub const SMOOTHED_NORMAL: &str = "SMOOTHED_NORMAL";

#[derive(Clone, Debug)]
enum Layout {
    Regular { spp: u32 },
    Irregular { offsets: Vec<u32> },
}

/// Per-pixel sample storage.
///
/// Base attributes live in parallel arrays indexed by a flat sample index. Samples of one
/// pixel are always contiguous and pixels are stored in row-major order, for both layouts.
pub struct SampleBuffer {
    width: u32,
    height: u32,
    layout: Layout,

    xy: Vec<Vec2>,
    uv: Vec<Vec2>,
    t: Vec<f32>,
    z: Vec<f32>,
    w: Vec<f32>,
    color: Vec<Vec4>,
    weight: Vec<f32>,

    channels: Vec<channel::Channel>,
}

impl SampleBuffer {
    pub fn new(width: u32, height: u32, spp: u32) -> Self {
        Self::with_layout(width, height, Layout::Regular { spp })
    }

    /// Builds an irregular buffer from per-pixel sample counts given in row-major order.
    pub fn new_irregular(width: u32, height: u32, counts: &[u32]) -> ReconResult<Self> {
        if counts.len() != width as usize * height as usize {
            return Err(ReconError::config(format!(
                "irregular buffer of {width}x{height} needs {} pixel counts, got {}",
                width as usize * height as usize,
                counts.len()
            )));
        }
        let mut offsets = Vec::with_capacity(counts.len() + 1);
        let mut total = 0u32;
        offsets.push(0);
        for &count in counts {
            total = total
                .checked_add(count)
                .ok_or_else(|| ReconError::config("too many samples for one buffer"))?;
            offsets.push(total);
        }
        Ok(Self::with_layout(width, height, Layout::Irregular { offsets }))
    }

    fn with_layout(width: u32, height: u32, layout: Layout) -> Self {
        let len = match &layout {
            Layout::Regular { spp } => width as usize * height as usize * *spp as usize,
            Layout::Irregular { offsets } => offsets.last().copied().unwrap_or(0) as usize,
        };

        let mut xy = Vec::with_capacity(len);
        let mut buffer = SampleBuffer {
            width,
            height,
            layout,
            xy: vec![],
            uv: vec![Vec2::ZERO; len],
            t: vec![0.0; len],
            z: vec![0.0; len],
            w: vec![0.0; len],
            color: vec![Vec4::ZERO; len],
            weight: vec![1.0; len],
            channels: vec![],
        };
        for y in 0..height {
            for x in 0..width {
                let center = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                xy.extend(std::iter::repeat_n(center, buffer.num_samples(x, y) as usize));
            }
        }
        buffer.xy = xy;
        buffer
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> UVec2 {
        UVec2::new(self.width, self.height)
    }

    pub fn is_regular(&self) -> bool {
        matches!(self.layout, Layout::Regular { .. })
    }

    /// Samples per pixel for regular buffers.
    pub fn samples_per_pixel(&self) -> Option<u32> {
        match self.layout {
            Layout::Regular { spp } => Some(spp),
            Layout::Irregular { .. } => None,
        }
    }

    pub fn len(&self) -> usize {
        self.color.len()
    }

    pub fn is_empty(&self) -> bool {
        self.color.is_empty()
    }

    pub fn num_samples(&self, x: u32, y: u32) -> u32 {
        match &self.layout {
            Layout::Regular { spp } => *spp,
            Layout::Irregular { offsets } => {
                let p = (y * self.width + x) as usize;
                offsets[p + 1] - offsets[p]
            }
        }
    }

    pub fn pixel_span(&self, x: u32, y: u32) -> Range<usize> {
        debug_assert!(x < self.width && y < self.height);
        let p = y as usize * self.width as usize + x as usize;
        match &self.layout {
            Layout::Regular { spp } => {
                let spp = *spp as usize;
                p * spp..(p + 1) * spp
            }
            Layout::Irregular { offsets } => offsets[p] as usize..offsets[p + 1] as usize,
        }
    }

    pub fn index(&self, x: u32, y: u32, i: u32) -> usize {
        let span = self.pixel_span(x, y);
        debug_assert!((i as usize) < span.len(), "sample {i} out of range at ({x}, {y})");
        span.start + i as usize
    }

    /// Flat pixel → sample-range table, detached from the buffer so it can be shared with
    /// worker threads.
    pub fn pixel_index(&self) -> PixelIndex {
        let offsets = match &self.layout {
            Layout::Regular { spp } => (0..=self.width * self.height).map(|p| p * spp).collect(),
            Layout::Irregular { offsets } => offsets.clone(),
        };
        PixelIndex {
            width: self.width,
            height: self.height,
            offsets,
        }
    }

    pub fn xy(&self) -> &[Vec2] {
        &self.xy
    }

    pub fn uv(&self) -> &[Vec2] {
        &self.uv
    }

    pub fn t(&self) -> &[f32] {
        &self.t
    }

    pub fn z(&self) -> &[f32] {
        &self.z
    }

    pub fn w(&self) -> &[f32] {
        &self.w
    }

    pub fn colors(&self) -> &[Vec4] {
        &self.color
    }

    pub fn weights(&self) -> &[f32] {
        &self.weight
    }

    pub fn sample_xy(&self, x: u32, y: u32, i: u32) -> Vec2 {
        self.xy[self.index(x, y, i)]
    }

    pub fn sample_uv(&self, x: u32, y: u32, i: u32) -> Vec2 {
        self.uv[self.index(x, y, i)]
    }

    pub fn sample_t(&self, x: u32, y: u32, i: u32) -> f32 {
        self.t[self.index(x, y, i)]
    }

    pub fn sample_z(&self, x: u32, y: u32, i: u32) -> f32 {
        self.z[self.index(x, y, i)]
    }

    pub fn sample_w(&self, x: u32, y: u32, i: u32) -> f32 {
        self.w[self.index(x, y, i)]
    }

    pub fn sample_color(&self, x: u32, y: u32, i: u32) -> Vec4 {
        self.color[self.index(x, y, i)]
    }

    pub fn sample_weight(&self, x: u32, y: u32, i: u32) -> f32 {
        self.weight[self.index(x, y, i)]
    }

    pub fn set_sample_xy(&mut self, x: u32, y: u32, i: u32, value: Vec2) {
        let idx = self.index(x, y, i);
        self.xy[idx] = value;
    }

    pub fn set_sample_uv(&mut self, x: u32, y: u32, i: u32, value: Vec2) {
        let idx = self.index(x, y, i);
        self.uv[idx] = value;
    }

    pub fn set_sample_t(&mut self, x: u32, y: u32, i: u32, value: f32) {
        let idx = self.index(x, y, i);
        self.t[idx] = value;
    }

    pub fn set_sample_z(&mut self, x: u32, y: u32, i: u32, value: f32) {
        let idx = self.index(x, y, i);
        self.z[idx] = value;
    }

    pub fn set_sample_w(&mut self, x: u32, y: u32, i: u32, value: f32) {
        let idx = self.index(x, y, i);
        self.w[idx] = value;
    }

    pub fn set_sample_color(&mut self, x: u32, y: u32, i: u32, value: Vec4) {
        let idx = self.index(x, y, i);
        self.color[idx] = value;
    }

    pub fn set_sample_weight(&mut self, x: u32, y: u32, i: u32, value: f32) {
        let idx = self.index(x, y, i);
        self.weight[idx] = value;
    }

    pub fn clear(&mut self, color: Vec4, depth: f32, w: f32) {
        self.color.fill(color);
        self.z.fill(depth);
        self.w.fill(w);
    }

    /// Writes the weighted mean color of every pixel into `image`, limited to the overlap
    /// of the two sizes.
    pub fn scan_out(&self, image: &mut impl ImageSink) {
        let size = image.size().min(self.size());
        for y in 0..size.y {
            for x in 0..size.x {
                let mut sum = Vec4::ZERO;
                let mut total = 0.0;
                for idx in self.pixel_span(x, y) {
                    sum += self.color[idx] * self.weight[idx];
                    total += self.weight[idx];
                }
                let color = if total > 0.0 { sum / total } else { Vec4::ZERO };
                image.set_vec4f(UVec2::new(x, y), color);
            }
        }
    }

    pub(crate) fn base_mut(&mut self) -> BaseAttributesMut<'_> {
        BaseAttributesMut {
            xy: &mut self.xy,
            uv: &mut self.uv,
            t: &mut self.t,
            z: &mut self.z,
            w: &mut self.w,
            color: &mut self.color,
            weight: &mut self.weight,
        }
    }
}

/// Mutable view of all base arrays, used by the loader to fill a buffer by flat index.
pub(crate) struct BaseAttributesMut<'a> {
    pub xy: &'a mut [Vec2],
    pub uv: &'a mut [Vec2],
    pub t: &'a mut [f32],
    pub z: &'a mut [f32],
    pub w: &'a mut [f32],
    pub color: &'a mut [Vec4],
    pub weight: &'a mut [f32],
}

#[derive(Clone, Debug)]
pub struct PixelIndex {
    width: u32,
    height: u32,
    offsets: Vec<u32>,
}

impl PixelIndex {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn span(&self, x: u32, y: u32) -> Range<usize> {
        let p = (y * self.width + x) as usize;
        self.offsets[p] as usize..self.offsets[p + 1] as usize
    }

    pub fn count(&self, x: u32, y: u32) -> usize {
        self.span(x, y).len()
    }

    /// All samples of scanline `y`.
    pub fn row(&self, y: u32) -> Range<usize> {
        let first = (y * self.width) as usize;
        let last = ((y + 1) * self.width) as usize;
        self.offsets[first] as usize..self.offsets[last] as usize
    }

    /// Pixel coordinates owning flat sample index `idx`.
    pub fn pixel_of(&self, idx: usize) -> UVec2 {
        let p = self.offsets.partition_point(|&o| o as usize <= idx) - 1;
        UVec2::new(p as u32 % self.width, p as u32 / self.width)
    }

    pub fn total(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0) as usize
    }
}

#[cfg(test)]
mod tests {
    use image::Rgba32FImage;

    use super::*;

    #[test]
    fn regular_buffers_have_constant_counts() {
        let buffer = SampleBuffer::new(7, 3, 5);
        for y in 0..3 {
            for x in 0..7 {
                assert_eq!(buffer.num_samples(x, y), 5);
            }
        }
        assert_eq!(buffer.len(), 7 * 3 * 5);
        assert_eq!(buffer.index(2, 1, 3), (7 + 2) * 5 + 3);
    }

    #[test]
    fn irregular_spans_follow_counts() {
        let buffer = SampleBuffer::new_irregular(2, 2, &[1, 0, 3, 2]).unwrap();
        assert!(!buffer.is_regular());
        assert_eq!(buffer.len(), 6);
        assert_eq!(buffer.pixel_span(0, 0), 0..1);
        assert_eq!(buffer.pixel_span(1, 0), 1..1);
        assert_eq!(buffer.pixel_span(0, 1), 1..4);
        assert_eq!(buffer.num_samples(1, 1), 2);

        let index = buffer.pixel_index();
        assert_eq!(index.row(1), 1..6);
        assert_eq!(index.pixel_of(3), UVec2::new(0, 1));
        assert_eq!(index.pixel_of(5), UVec2::new(1, 1));
    }

    #[test]
    fn irregular_count_mismatch_is_rejected() {
        assert!(SampleBuffer::new_irregular(2, 2, &[1, 2, 3]).is_err());
    }

    #[test]
    fn clear_resets_base_attributes() {
        let mut buffer = SampleBuffer::new(2, 1, 2);
        buffer.set_sample_color(1, 0, 1, Vec4::ONE);
        buffer.set_sample_z(0, 0, 0, 5.0);
        buffer.clear(Vec4::new(0.1, 0.2, 0.3, 1.0), 1.0, 2.0);
        assert!(buffer.colors().iter().all(|&c| c == Vec4::new(0.1, 0.2, 0.3, 1.0)));
        assert!(buffer.z().iter().all(|&z| z == 1.0));
        assert!(buffer.w().iter().all(|&w| w == 2.0));
    }

    #[test]
    fn scan_out_uses_weighted_mean_and_clamps_size() {
        let mut buffer = SampleBuffer::new(3, 2, 2);
        buffer.set_sample_color(0, 0, 0, Vec4::new(1.0, 0.0, 0.0, 1.0));
        buffer.set_sample_color(0, 0, 1, Vec4::new(0.0, 1.0, 0.0, 1.0));
        buffer.set_sample_weight(0, 0, 1, 3.0);

        let mut image = Rgba32FImage::new(2, 2);
        buffer.scan_out(&mut image);
        let px = image.get_pixel(0, 0).0;
        assert!((px[0] - 0.25).abs() < 1e-6);
        assert!((px[1] - 0.75).abs() < 1e-6);
        assert_eq!(image.get_pixel(1, 1).0, [0.0; 4]);
    }
}

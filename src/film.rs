use std::time::Duration;

use glam::{UVec2, Vec3, Vec4};
use image::{Rgb, RgbImage, Rgba, Rgba32FImage};

use crate::samples::PixelIndex;

/// Relative change of scene energy above which a filter pass is reported.
pub const ENERGY_TOLERANCE: f64 = 1e-4;

/// Two-dimensional float RGBA destination.
pub trait ImageSink {
    fn size(&self) -> UVec2;
    fn set_vec4f(&mut self, pixel: UVec2, color: Vec4);
}

impl ImageSink for Rgba32FImage {
    fn size(&self) -> UVec2 {
        UVec2::new(self.width(), self.height())
    }

    fn set_vec4f(&mut self, pixel: UVec2, color: Vec4) {
        self.put_pixel(pixel.x, pixel.y, Rgba(color.to_array()));
    }
}

/// Per-sample output of a reconstruction pass.
#[derive(Clone, Debug)]
pub struct FilteredSamples {
    pub colors: Vec<Vec3>,
    /// Albedo to multiply back in when the colors were filtered demodulated.
    pub albedo: Option<Vec<Vec3>>,
    pub report: FilterReport,
}

#[derive(Clone, Debug, Default)]
pub struct FilterReport {
    pub input_energy: f64,
    pub output_energy: f64,
    pub elapsed: Duration,
}

impl FilterReport {
    pub fn relative_energy_change(&self) -> f64 {
        if self.input_energy == 0.0 {
            return if self.output_energy == 0.0 { 0.0 } else { f64::INFINITY };
        }
        (self.output_energy - self.input_energy).abs() / self.input_energy.abs()
    }

    pub fn warn_on_drift(&self, filter: &str) {
        let change = self.relative_energy_change();
        if change > ENERGY_TOLERANCE {
            tracing::warn!(
                input = self.input_energy,
                output = self.output_energy,
                "{filter} changed scene energy by {:.3}%",
                change * 100.0
            );
        }
    }
}

impl FilteredSamples {
    pub fn color(&self, idx: usize) -> Vec3 {
        match &self.albedo {
            Some(albedo) => self.colors[idx] * albedo[idx],
            None => self.colors[idx],
        }
    }

    /// Averages the samples of every pixel into `image` (weighted by the per-sample scan-out
    /// weight); pixels without weight get `background`.
    pub fn resolve(
        &self,
        index: &PixelIndex,
        weights: &[f32],
        image: &mut impl ImageSink,
        background: Vec4,
    ) {
        let size = image.size().min(UVec2::new(index.width(), index.height()));
        for y in 0..size.y {
            for x in 0..size.x {
                let mut sum = Vec3::ZERO;
                let mut total = 0.0;
                for idx in index.span(x, y) {
                    sum += self.color(idx) * weights[idx];
                    total += weights[idx];
                }
                let color = match total > 0.0 {
                    true => (sum / total).extend(1.0),
                    false => background,
                };
                image.set_vec4f(UVec2::new(x, y), color);
            }
        }
    }

    pub fn energy(&self, index: &PixelIndex) -> f64 {
        scene_energy(index, |idx| self.color(idx))
    }
}

/// Area-weighted radiance: every pixel contributes the mean of its samples, summed over
/// the color channels.
pub fn scene_energy(index: &PixelIndex, color: impl Fn(usize) -> Vec3) -> f64 {
    let mut energy = 0.0f64;
    for y in 0..index.height() {
        for x in 0..index.width() {
            let span = index.span(x, y);
            if span.is_empty() {
                continue;
            }
            let n = span.len() as f64;
            let sum: f64 = span.map(|idx| color(idx).element_sum() as f64).sum();
            energy += sum / n;
        }
    }
    energy
}

pub fn to_srgb8(linear: &Rgba32FImage, scale: f32) -> RgbImage {
    RgbImage::from_fn(linear.width(), linear.height(), |x, y| {
        let rgb = Vec4::from_array(linear.get_pixel(x, y).0).truncate() * scale;
        let rgb = rgb.clamp(Vec3::ZERO, Vec3::ONE);
        let low = rgb * 12.92;
        let high = rgb.powf(1.0 / 2.4) * 1.055 - 0.055;
        let srgb = Vec3::select(rgb.cmplt(Vec3::splat(0.0031308)), low, high);
        Rgb((srgb * 255.0).round().as_u8vec3().to_array())
    })
}

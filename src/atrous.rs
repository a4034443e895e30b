//! Edge-avoiding À-Trous filtering.
//!
//! Each pass filters every sample against the samples of a fixed 5×5 (by default) grid of
//! pixels whose spacing doubles from one pass to the next. Weights are Gaussian in the
//! enabled feature distances. Every width halves each pass so later, wider passes only
//! average samples that agree closely; screen distance is measured in grid steps.

use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use glam::{Vec2, Vec3};
use rand::Rng;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::{ReconError, ReconResult};
use crate::film::{FilterReport, FilteredSamples, scene_energy};
use crate::launcher::{MulticoreLauncher, TaskPool};
use crate::options::{AlbedoMode, AtrousOptions, AtrousSignal};
use crate::reconstruct::{Reconstruction, demodulate, row_rng};
use crate::samples::{
    ALBEDO, AMBIENT_OCCLUSION, PRIMARY_HIT, PRIMARY_NORMAL, PixelIndex, SECONDARY_HIT,
    SECONDARY_NORMAL, SMOOTHED_NORMAL, SampleBuffer,
};
use crate::stats::Moments;

/// Smallest width any Gaussian term is given, so constant features do not divide by zero.
const MIN_SIGMA: f32 = 1e-6;

pub struct Atrous {
    options: AtrousOptions,
}

impl Atrous {
    pub fn new(options: AtrousOptions) -> ReconResult<Self> {
        options.validate()?;
        Ok(Atrous { options })
    }

    pub fn options(&self) -> &AtrousOptions {
        &self.options
    }
}

impl Reconstruction for Atrous {
    fn name(&self) -> &'static str {
        "À-Trous"
    }

    fn prepare(&self, buffer: &mut SampleBuffer) -> ReconResult<()> {
        if self.options.smoothed_normals && self.options.stops.normal {
            buffer.smoothed_normals()?;
        }
        Ok(())
    }

    fn filter(&self, buffer: &SampleBuffer, pool: &TaskPool) -> ReconResult<FilteredSamples> {
        let t = Instant::now();
        if !buffer.is_regular() {
            return Err(ReconError::config(
                "À-Trous filtering needs a regular sample buffer",
            ));
        }

        let frame = Arc::new(Frame::capture(buffer, &self.options)?);
        let input_energy = scene_energy(&frame.index, |i| frame.modulated(&frame.colors, i));
        let color_sigma = (self.options.tuning.color * spread(&frame.colors, &frame.valid))
            .min(self.options.tuning.max_color_sigma);
        for term in &frame.terms {
            debug!(term = term.name, sigma = term.sigma, "À-Trous edge stop");
        }
        debug!(color_sigma, "À-Trous edge stop");

        let mut colors = Arc::new(frame.colors.clone());
        for iteration in 0..self.options.iterations {
            let it = Instant::now();
            let pass = Arc::new(Pass::new(
                frame.clone(),
                colors.clone(),
                &self.options,
                color_sigma,
                iteration,
            ));
            let step = pass.step;

            let launcher = MulticoreLauncher::with_pool(pool);
            launcher.push(
                move |_, row| Ok(pass.filter_row(row as u32)),
                0,
                buffer.height() as usize,
            );

            let mut next = vec![Vec3::ZERO; buffer.len()];
            let label = format!("À-Trous {}/{}", iteration + 1, self.options.iterations);
            for task in launcher.pop_all(Some(&label)) {
                next[frame.index.row(task.index as u32)].copy_from_slice(&task.result);
            }
            colors = Arc::new(next);
            info!(
                "À-Trous pass {}/{} (step {step}) in {:.3?}",
                iteration + 1,
                self.options.iterations,
                it.elapsed()
            );
        }

        let colors = Arc::try_unwrap(colors).unwrap_or_else(|shared| (*shared).clone());
        let mut filtered = FilteredSamples {
            colors,
            albedo: frame.albedo.clone(),
            report: FilterReport {
                input_energy,
                ..FilterReport::default()
            },
        };
        filtered.report.output_energy = filtered.energy(&frame.index);
        filtered.report.elapsed = t.elapsed();
        filtered.report.warn_on_drift(self.name());
        Ok(filtered)
    }
}

/// A per-sample vector feature compared with a Gaussian edge stop.
struct Term {
    name: &'static str,
    values: Vec<Vec3>,
    /// Width at the first pass.
    sigma: f32,
}

/// Immutable per-sample inputs of one filtering call.
struct Frame {
    index: PixelIndex,
    xy: Vec<Vec2>,
    valid: Vec<bool>,
    colors: Vec<Vec3>,
    albedo: Option<Vec<Vec3>>,
    terms: Vec<Term>,
}

impl Frame {
    fn capture(buffer: &SampleBuffer, options: &AtrousOptions) -> ReconResult<Frame> {
        let n = buffer.len();
        let valid: Vec<bool> = match buffer.optional_channel::<Vec3>(PRIMARY_HIT)? {
            Some(hits) => hits.iter().map(|h| h.is_finite()).collect(),
            None => vec![true; n],
        };

        let mut colors: Vec<Vec3> = match options.signal {
            AtrousSignal::Radiance => buffer.colors().iter().map(|c| c.truncate()).collect(),
            AtrousSignal::AmbientOcclusion => buffer
                .named_channel::<f32>(AMBIENT_OCCLUSION)?
                .iter()
                .map(|&ao| Vec3::splat(ao))
                .collect(),
        };

        let albedo = match options.albedo {
            AlbedoMode::Keep => None,
            AlbedoMode::Demodulate => {
                let albedo = buffer.named_channel::<Vec3>(ALBEDO)?;
                let divisors = colors
                    .iter_mut()
                    .zip(albedo)
                    .map(|(color, &a)| {
                        let (demodulated, divisor) = demodulate(*color, a);
                        *color = demodulated;
                        divisor
                    })
                    .collect();
                Some(divisors)
            }
        };

        let tuning = &options.tuning;
        let stops = &options.stops;
        let normals = match options.smoothed_normals {
            true => SMOOTHED_NORMAL,
            false => PRIMARY_NORMAL,
        };
        let mut terms = vec![];
        for (enabled, name, scale) in [
            (stops.normal, normals, tuning.normal),
            (stops.position, PRIMARY_HIT, tuning.position),
            (stops.secondary_normal, SECONDARY_NORMAL, tuning.secondary_normal),
            (stops.secondary_position, SECONDARY_HIT, tuning.secondary_position),
        ] {
            if !enabled {
                continue;
            }
            let values: Vec<Vec3> = buffer
                .named_channel::<Vec3>(name)?
                .iter()
                .map(|v| if v.is_finite() { *v } else { Vec3::ZERO })
                .collect();
            let sigma = scale * spread(&values, &valid);
            terms.push(Term {
                name,
                values,
                sigma,
            });
        }

        Ok(Frame {
            index: buffer.pixel_index(),
            xy: buffer.xy().to_vec(),
            valid,
            colors,
            albedo,
            terms,
        })
    }

    fn modulated(&self, colors: &[Vec3], i: usize) -> Vec3 {
        match &self.albedo {
            Some(albedo) => colors[i] * albedo[i],
            None => colors[i],
        }
    }
}

/// Root mean square distance of the valid values from their mean.
fn spread(values: &[Vec3], valid: &[bool]) -> f32 {
    let moments = values
        .par_iter()
        .zip(valid)
        .filter(|(_, ok)| **ok)
        .fold(
            || [Moments::default(); 3],
            |mut acc, (v, _)| {
                for (c, m) in acc.iter_mut().enumerate() {
                    m.push(v[c]);
                }
                acc
            },
        )
        .reduce(
            || [Moments::default(); 3],
            |a, b| [a[0].merge(b[0]), a[1].merge(b[1]), a[2].merge(b[2])],
        );
    moments.iter().map(Moments::variance).sum::<f32>().sqrt()
}

/// `1 / 2σ²`.
fn falloff(sigma: f32) -> f32 {
    let sigma = sigma.max(MIN_SIGMA);
    1.0 / (2.0 * sigma * sigma)
}

/// Width of a Gaussian term at `iteration`, halving every pass.
fn pass_sigma(first: f32, iteration: u32) -> f32 {
    first / (1u32 << iteration) as f32
}

/// Read-only state shared by the row tasks of one pass. Gaussian terms are stored as
/// `1 / 2σ²`.
struct Pass {
    frame: Arc<Frame>,
    colors: Arc<Vec<Vec3>>,
    iteration: u32,
    step: i32,
    radius: i32,
    jitter: bool,
    seed: u64,
    screen: Option<f32>,
    color: Option<f32>,
    terms: Vec<f32>,
}

impl Pass {
    fn new(
        frame: Arc<Frame>,
        colors: Arc<Vec<Vec3>>,
        options: &AtrousOptions,
        color_sigma: f32,
        iteration: u32,
    ) -> Pass {
        let stops = &options.stops;
        let sigma = |first: f32| falloff(pass_sigma(first, iteration));
        let terms = frame.terms.iter().map(|t| sigma(t.sigma)).collect();
        Pass {
            frame,
            colors,
            iteration,
            step: 1 << iteration,
            radius: options.radius as i32,
            jitter: options.jitter,
            seed: options.seed,
            screen: stops.screen.then(|| sigma(options.tuning.screen)),
            color: stops.color.then(|| sigma(color_sigma)),
            terms,
        }
    }

    fn filter_row(&self, y: u32) -> Vec<Vec3> {
        let frame = &*self.frame;
        let colors = &self.colors[..];
        let (width, height) = (frame.index.width() as i32, frame.index.height() as i32);
        let gap = (self.step - 1) / 2;
        let mut rng = row_rng(self.seed, self.iteration, y);

        let mut out = Vec::with_capacity(frame.index.row(y).len());
        let mut taps: Vec<Range<usize>> = vec![];
        for x in 0..width {
            taps.clear();
            for dy in -self.radius..=self.radius {
                for dx in -self.radius..=self.radius {
                    let (mut qx, mut qy) = (x + dx * self.step, y as i32 + dy * self.step);
                    if self.jitter && gap > 0 && (dx, dy) != (0, 0) {
                        qx += rng.random_range(-gap..=gap);
                        qy += rng.random_range(-gap..=gap);
                    }
                    if qx >= 0 && qy >= 0 && qx < width && qy < height {
                        taps.push(frame.index.span(qx as u32, qy as u32));
                    }
                }
            }

            for i in frame.index.span(x as u32, y) {
                if !frame.valid[i] {
                    out.push(colors[i]);
                    continue;
                }
                let mut sum = Vec3::ZERO;
                let mut total = 0.0;
                for j in taps.iter().flat_map(|tap| tap.clone()) {
                    if !frame.valid[j] {
                        continue;
                    }
                    let w = (-self.distance(i, j)).exp();
                    sum += colors[j] * w;
                    total += w;
                }
                out.push(if total > 0.0 { sum / total } else { colors[i] });
            }
        }
        out
    }

    fn distance(&self, i: usize, j: usize) -> f32 {
        let frame = &*self.frame;
        let mut d = 0.0;
        if let Some(k) = self.screen {
            // Measured in steps of the dilated grid.
            let offset = (frame.xy[i] - frame.xy[j]) / self.step as f32;
            d += offset.length_squared() * k;
        }
        if let Some(k) = self.color {
            d += self.colors[i].distance_squared(self.colors[j]) * k;
        }
        for (term, k) in frame.terms.iter().zip(&self.terms) {
            d += term.values[i].distance_squared(term.values[j]) * k;
        }
        d
    }
}

//! Random parameter filtering.
//!
//! Every pixel is filtered against a neighborhood of samples with similar geometry. How much
//! color and each scene feature count in the bilateral weights follows from how strongly they
//! depend on the random parameters of the sample (lens, time, bounce direction) as opposed to
//! its screen position, measured with mutual information on the normalized neighborhood.

use std::sync::Arc;
use std::time::Instant;

use glam::Vec3;
use tracing::{debug, info};

use crate::error::ReconResult;
use crate::film::{FilterReport, FilteredSamples, scene_energy};
use crate::launcher::{MulticoreLauncher, TaskPool};
use crate::options::{ClampMode, RpfIteration, RpfOptions};
use crate::reconstruct::{Reconstruction, row_rng};
use crate::samples::{PixelIndex, SampleBuffer};
use crate::stats::Moments;

mod features;
mod neighborhood;
mod weights;

use features::Snapshot;
use neighborhood::Selector;
use weights::Workspace;

const LUMINANCE: Vec3 = Vec3::new(0.2126, 0.7152, 0.0722);

pub struct Rpf {
    options: RpfOptions,
}

impl Rpf {
    pub fn new(options: RpfOptions) -> ReconResult<Self> {
        options.validate()?;
        Ok(Rpf { options })
    }

    pub fn options(&self) -> &RpfOptions {
        &self.options
    }
}

impl Reconstruction for Rpf {
    fn name(&self) -> &'static str {
        "RPF"
    }

    fn filter(&self, buffer: &SampleBuffer, pool: &TaskPool) -> ReconResult<FilteredSamples> {
        let t = Instant::now();
        let snapshot = Arc::new(Snapshot::capture(buffer, &self.options)?);
        let index = Arc::new(buffer.pixel_index());
        let input_energy = scene_energy(&index, |i| buffer.colors()[i].truncate());

        let pixels = buffer.width() as usize * buffer.height() as usize;
        let mean_spp = buffer.len() as f32 / pixels.max(1) as f32;
        let passes = self.options.iterations.len();

        let mut colors = Arc::new(snapshot.colors.clone());
        for (iteration, &params) in self.options.iterations.iter().enumerate() {
            let it = Instant::now();
            let box_area = (params.box_size * params.box_size) as f32;
            let pass = Arc::new(Pass {
                snapshot: snapshot.clone(),
                colors: colors.clone(),
                index: index.clone(),
                iteration: iteration as u32,
                params,
                target: (params.neighbor_fraction * box_area * mean_spp) as usize,
                options: self.options.clone(),
            });
            debug!(
                iteration,
                box_size = params.box_size,
                target = pass.target,
                "RPF pass"
            );

            let launcher = MulticoreLauncher::with_pool(pool);
            launcher.push(
                move |_, row| Ok(pass.filter_row(row as u32)),
                0,
                index.height() as usize,
            );

            let mut next = vec![Vec3::ZERO; buffer.len()];
            let label = format!("RPF {}/{passes}", iteration + 1);
            for task in launcher.pop_all(Some(&label)) {
                next[index.row(task.index as u32)].copy_from_slice(&task.result);
            }
            colors = Arc::new(next);
            info!(
                "RPF pass {}/{passes} (box {}) in {:.3?}",
                iteration + 1,
                params.box_size,
                it.elapsed()
            );
        }

        let colors = Arc::try_unwrap(colors).unwrap_or_else(|shared| (*shared).clone());
        let mut filtered = FilteredSamples {
            colors,
            albedo: snapshot.albedo.clone(),
            report: FilterReport {
                input_energy,
                ..FilterReport::default()
            },
        };
        filtered.report.output_energy = filtered.energy(&index);
        filtered.report.elapsed = t.elapsed();
        filtered.report.warn_on_drift(self.name());
        Ok(filtered)
    }
}

/// Read-only state shared by the row tasks of one iteration.
struct Pass {
    snapshot: Arc<Snapshot>,
    colors: Arc<Vec<Vec3>>,
    index: Arc<PixelIndex>,
    iteration: u32,
    params: RpfIteration,
    target: usize,
    options: RpfOptions,
}

impl Pass {
    fn filter_row(&self, y: u32) -> Vec<Vec3> {
        let mut rng = row_rng(self.options.seed, self.iteration, y);
        let mut workspace = Workspace::new(self.options.mi_buckets);
        let selector = Selector {
            features: &self.snapshot.features,
            index: &self.index,
            box_size: self.params.box_size,
            target: self.target,
        };

        let mut out = Vec::with_capacity(self.index.row(y).len());
        let mut samples = vec![];
        let mut filtered = vec![];
        for x in 0..self.index.width() {
            let own = selector.select(x, y, &mut rng, &mut samples);
            if own == 0 {
                continue;
            }
            workspace.load(&self.snapshot.features, &self.colors, &samples);
            let deps = workspace.dependencies(self.iteration, self.options.weight_formula);
            workspace.filter(
                &deps,
                own,
                self.options.noise,
                &self.colors,
                &samples,
                &mut filtered,
            );
            if let Some(mode) = self.options.outlier_clamp {
                clamp_outliers(&mut filtered, mode);
            }
            out.extend_from_slice(&filtered);
        }
        out
    }
}

/// Pulls colors more than one standard deviation from the pixel mean back to the mean, then
/// spreads the energy this removed evenly over all samples of the pixel.
pub fn clamp_outliers(colors: &mut [Vec3], mode: ClampMode) {
    if colors.len() < 2 {
        return;
    }
    let before: Vec3 = colors.iter().sum();

    match mode {
        ClampMode::PerChannel => {
            for c in 0..3 {
                let m: Moments = colors.iter().map(|v| v[c]).collect();
                let (mean, std) = (m.mean(), m.std_dev());
                for v in colors.iter_mut() {
                    if (v[c] - mean).abs() > std {
                        v[c] = mean;
                    }
                }
            }
        }
        ClampMode::Luminance => {
            let m: Moments = colors.iter().map(|v| v.dot(LUMINANCE)).collect();
            let mean_color = before / colors.len() as f32;
            let (mean, std) = (m.mean(), m.std_dev());
            for v in colors.iter_mut() {
                if (v.dot(LUMINANCE) - mean).abs() > std {
                    *v = mean_color;
                }
            }
        }
    }

    let after: Vec3 = colors.iter().sum();
    let shift = (before - after) / colors.len() as f32;
    colors.iter_mut().for_each(|v| *v += shift);
}

#[cfg(test)]
mod tests {
    use glam::Vec4;

    use super::*;
    use crate::samples::{ALBEDO, PRIMARY_HIT, PRIMARY_NORMAL};

    #[test]
    fn clamp_conserves_pixel_energy() {
        for mode in [ClampMode::PerChannel, ClampMode::Luminance] {
            let mut colors = vec![
                Vec3::splat(1.0),
                Vec3::splat(1.0),
                Vec3::splat(1.0),
                Vec3::splat(9.0),
            ];
            let before: Vec3 = colors.iter().sum();
            clamp_outliers(&mut colors, mode);
            let after: Vec3 = colors.iter().sum();

            assert!((before - after).abs().max_element() < 1e-4);
            assert!(colors.iter().all(|c| c.x < 9.0));
            assert!((colors[0] - colors[1]).length() < 1e-6);
        }
    }

    #[test]
    fn clamp_leaves_agreeing_samples_alone() {
        for mode in [ClampMode::PerChannel, ClampMode::Luminance] {
            let mut colors = vec![Vec3::new(0.25, 0.5, 2.0); 5];
            clamp_outliers(&mut colors, mode);
            assert_eq!(colors, vec![Vec3::new(0.25, 0.5, 2.0); 5]);

            let mut single = [Vec3::splat(100.0)];
            clamp_outliers(&mut single, mode);
            assert_eq!(single[0], Vec3::splat(100.0));
        }
    }

    #[test]
    fn filters_every_sample_of_a_small_scene() {
        let mut buffer = SampleBuffer::new(6, 5, 4);
        let n = buffer.len();
        buffer.insert_channel(PRIMARY_HIT, vec![Vec3::ZERO; n]).unwrap();
        buffer.insert_channel(PRIMARY_NORMAL, vec![Vec3::Y; n]).unwrap();
        buffer.insert_channel(ALBEDO, vec![Vec3::ONE; n]).unwrap();
        buffer.clear(Vec4::new(0.5, 0.5, 0.5, 1.0), 0.0, 0.0);

        let rpf = Rpf::new(RpfOptions {
            iterations: vec![RpfIteration::new(5, 0.5), RpfIteration::new(3, 0.5)],
            ..RpfOptions::default()
        })
        .unwrap();
        let filtered = rpf.filter(&buffer, &TaskPool::new(2)).unwrap();

        assert_eq!(filtered.colors.len(), n);
        assert!(
            filtered
                .colors
                .iter()
                .all(|c| (*c - Vec3::splat(0.5)).abs().max_element() < 1e-5)
        );
        assert!(filtered.report.relative_energy_change() < 1e-4);
    }
}

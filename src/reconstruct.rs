use std::time::Instant;

use glam::Vec3;
use rand::SeedableRng;
use rand::rngs::SmallRng;

use crate::error::ReconResult;
use crate::film::{FilterReport, FilteredSamples, scene_energy};
use crate::launcher::TaskPool;
use crate::samples::SampleBuffer;

/// Albedo components below this are not divided out.
pub(crate) const MIN_ALBEDO: f32 = 1e-3;

/// A reconstruction filter over a sample buffer.
pub trait Reconstruction {
    fn name(&self) -> &'static str;

    /// Derives any channels the filter needs but a loader does not provide.
    fn prepare(&self, _buffer: &mut SampleBuffer) -> ReconResult<()> {
        Ok(())
    }

    fn filter(&self, buffer: &SampleBuffer, pool: &TaskPool) -> ReconResult<FilteredSamples>;
}

/// Plain per-pixel averaging of the input samples.
pub struct BoxReconstruction;

impl Reconstruction for BoxReconstruction {
    fn name(&self) -> &'static str {
        "box"
    }

    fn filter(&self, buffer: &SampleBuffer, _pool: &TaskPool) -> ReconResult<FilteredSamples> {
        let t = Instant::now();
        let colors: Vec<Vec3> = buffer.colors().iter().map(|c| c.truncate()).collect();
        let energy = scene_energy(&buffer.pixel_index(), |i| colors[i]);
        Ok(FilteredSamples {
            colors,
            albedo: None,
            report: FilterReport {
                input_energy: energy,
                output_energy: energy,
                elapsed: t.elapsed(),
            },
        })
    }
}

/// Generator for one scanline of one pass, independent of which worker runs it.
pub(crate) fn row_rng(seed: u64, iteration: u32, row: u32) -> SmallRng {
    let stream = (iteration as u64) << 32 | row as u64;
    SmallRng::seed_from_u64(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ stream)
}

/// Splits `color` into a reflectance-free part and the divisor to multiply back in.
pub(crate) fn demodulate(color: Vec3, albedo: Vec3) -> (Vec3, Vec3) {
    let divisor = Vec3::select(albedo.cmpgt(Vec3::splat(MIN_ALBEDO)), albedo, Vec3::ONE);
    (color / divisor, divisor)
}

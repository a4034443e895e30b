use std::ops::Range;

use glam::Vec3;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::ReconResult;
use crate::options::{AlbedoMode, RpfOptions};
use crate::reconstruct::{demodulate, row_rng};
use crate::samples::{
    ALBEDO, PRIMARY_HIT, PRIMARY_NORMAL, SECONDARY_HIT, SECONDARY_NORMAL, SampleBuffer,
};

// Feature vector layout. Each group is a contiguous range so a neighborhood stored column by
// column exposes every attribute as its own signal.
pub const POSITION: Range<usize> = 0..2;
pub const RANDOM: Range<usize> = 2..8;
pub const SCENE: Range<usize> = 8..23;
pub const COLOR: Range<usize> = 23..26;
pub const FEATURES: usize = COLOR.end;
pub const SCENE_LEN: usize = SCENE.end - SCENE.start;

const LENS: usize = 2;
const TIME: usize = 4;
const BOUNCE: usize = 5;
const PRIMARY_HIT_AT: usize = 8;
const PRIMARY_NORMAL_AT: usize = 11;
const SECONDARY_HIT_AT: usize = 14;
const SECONDARY_NORMAL_AT: usize = 17;
const ALBEDO_AT: usize = 20;

/// Pixels with fewer valid samples than this are reported.
pub const MIN_VALID_SAMPLES: usize = 4;

/// Every attribute except color. Fixed for a whole filtering call.
pub type Features = [f32; SCENE.end];

/// World-space positions vary far more inside one pixel than directions or reflectance do.
pub fn is_position_like(k: usize) -> bool {
    (PRIMARY_HIT_AT..PRIMARY_HIT_AT + 3).contains(&k)
        || (SECONDARY_HIT_AT..SECONDARY_HIT_AT + 3).contains(&k)
}

/// Unnormalized per-sample features and colors captured once per filtering call.
pub struct Snapshot {
    pub features: Vec<Features>,
    pub colors: Vec<Vec3>,
    /// Divisors taken out of `colors` when filtering demodulated radiance.
    pub albedo: Option<Vec<Vec3>>,
    pub replaced: usize,
}

impl Snapshot {
    pub fn capture(buffer: &SampleBuffer, options: &RpfOptions) -> ReconResult<Snapshot> {
        let primary_hit = buffer.named_channel::<Vec3>(PRIMARY_HIT)?;
        let primary_normal = buffer.named_channel::<Vec3>(PRIMARY_NORMAL)?;
        let albedo = buffer.named_channel::<Vec3>(ALBEDO)?;
        let secondary_hit = buffer.optional_channel::<Vec3>(SECONDARY_HIT)?;
        let secondary_normal = buffer.optional_channel::<Vec3>(SECONDARY_NORMAL)?;

        let n = buffer.len();
        let demodulated = options.albedo == AlbedoMode::Demodulate;
        let mut features = Vec::with_capacity(n);
        let mut colors = Vec::with_capacity(n);
        let mut divisors = Vec::with_capacity(if demodulated { n } else { 0 });

        for i in 0..n {
            let mut f = [0.0; SCENE.end];
            let xy = buffer.xy()[i];
            let uv = buffer.uv()[i];
            f[0] = xy.x;
            f[1] = xy.y;
            f[LENS] = uv.x;
            f[LENS + 1] = uv.y;
            f[TIME] = buffer.t()[i];

            let hit = primary_hit[i];
            if let Some(secondary) = secondary_hit.map(|s| s[i]).filter(|s| s.is_finite()) {
                put(&mut f, BOUNCE, (secondary - hit).normalize_or_zero());
                put(&mut f, SECONDARY_HIT_AT, secondary);
            }
            put(&mut f, PRIMARY_HIT_AT, finite_or_zero(hit));
            put(&mut f, PRIMARY_NORMAL_AT, finite_or_zero(primary_normal[i]));
            if let Some(normals) = secondary_normal {
                put(&mut f, SECONDARY_NORMAL_AT, finite_or_zero(normals[i]));
            }
            put(&mut f, ALBEDO_AT, finite_or_zero(albedo[i]));
            features.push(f);

            let color = buffer.colors()[i].truncate();
            if demodulated {
                let (color, divisor) = demodulate(color, finite_or_zero(albedo[i]));
                colors.push(color);
                divisors.push(divisor);
            } else {
                colors.push(color);
            }
        }

        let mut snapshot = Snapshot {
            features,
            colors,
            albedo: demodulated.then_some(divisors),
            replaced: 0,
        };
        snapshot.replace_invalid(buffer, primary_hit, options.seed);
        Ok(snapshot)
    }

    /// Samples whose camera ray left the scene take the features of a random valid sample of
    /// the same pixel and contribute no color. Pixels without any valid sample keep their
    /// screen position, zero features and the pixel's mean color.
    fn replace_invalid(&mut self, buffer: &SampleBuffer, primary_hit: &[Vec3], seed: u64) {
        let mut sparse = 0;
        let mut valid = vec![];
        for y in 0..buffer.height() {
            let mut rng = row_rng(seed, u32::MAX, y);
            for x in 0..buffer.width() {
                let span = buffer.pixel_span(x, y);
                if span.is_empty() {
                    continue;
                }
                valid.clear();
                valid.extend(span.clone().filter(|&i| primary_hit[i].is_finite()));
                if valid.len() < MIN_VALID_SAMPLES {
                    sparse += 1;
                    debug!(x, y, valid = valid.len(), "pixel has few valid samples");
                }
                if valid.len() == span.len() {
                    continue;
                }

                let mean = span
                    .clone()
                    .map(|i| buffer.colors()[i].truncate())
                    .sum::<Vec3>()
                    / span.len() as f32;
                for i in span.filter(|&i| !primary_hit[i].is_finite()) {
                    let mut f = [0.0; SCENE.end];
                    f[POSITION].copy_from_slice(&self.features[i][POSITION]);
                    if valid.is_empty() {
                        self.colors[i] = mean;
                        if let Some(divisors) = &mut self.albedo {
                            divisors[i] = Vec3::ONE;
                        }
                    } else {
                        let j = valid[rng.random_range(0..valid.len())];
                        f[RANDOM.start..].copy_from_slice(&self.features[j][RANDOM.start..]);
                        self.colors[i] = Vec3::ZERO;
                        if let Some(divisors) = &mut self.albedo {
                            divisors[i] = divisors[j];
                        }
                    }
                    self.features[i] = f;
                    self.replaced += 1;
                    debug!(sample = i, x, y, "replaced invalid sample");
                }
            }
        }

        if self.replaced > 0 {
            warn!("Replaced {} samples that missed the scene", self.replaced);
        }
        if sparse > 0 {
            warn!("{sparse} pixels have fewer than {MIN_VALID_SAMPLES} valid samples");
        }
    }
}

fn put(f: &mut Features, at: usize, v: Vec3) {
    f[at..at + 3].copy_from_slice(&v.to_array());
}

fn finite_or_zero(v: Vec3) -> Vec3 {
    if v.is_finite() { v } else { Vec3::ZERO }
}

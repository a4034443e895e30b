use std::f32::consts::TAU;

use rand::Rng;
use rand::rngs::SmallRng;

use super::features::{Features, SCENE, SCENE_LEN, is_position_like};
use crate::samples::PixelIndex;
use crate::stats::Moments;

const POSITION_TOLERANCE: f32 = 30.0;
const FEATURE_TOLERANCE: f32 = 3.0;
/// Deviation always accepted, so pixels whose own samples agree exactly still find neighbors.
const TOLERANCE_FLOOR: f32 = 0.1;

/// Draws the samples one pixel is filtered against.
pub struct Selector<'a> {
    pub features: &'a [Features],
    pub index: &'a PixelIndex,
    pub box_size: u32,
    /// Neighborhood size to aim for, own samples included.
    pub target: usize,
}

impl Selector<'_> {
    /// Fills `out` with the samples of pixel `(x, y)` followed by accepted neighbors and
    /// returns how many of them are the pixel's own.
    pub fn select(&self, x: u32, y: u32, rng: &mut SmallRng, out: &mut Vec<usize>) -> usize {
        out.clear();
        let span = self.index.span(x, y);
        out.extend(span.clone());
        let own = out.len();
        if own == 0 {
            return 0;
        }

        let tolerance = Tolerance::of(self.features, span.start..span.end);
        let sigma = self.box_size as f32 / 4.0;
        let half = (self.box_size / 2) as i32;
        let (width, height) = (self.index.width() as i32, self.index.height() as i32);

        for _ in own..self.target.max(own) {
            let (gx, gy) = gaussian_pair(rng);
            let dx = (gx * sigma).round() as i32;
            let dy = (gy * sigma).round() as i32;
            if dx.abs() > half || dy.abs() > half || (dx == 0 && dy == 0) {
                continue;
            }
            let (qx, qy) = (x as i32 + dx, y as i32 + dy);
            if qx < 0 || qy < 0 || qx >= width || qy >= height {
                continue;
            }

            let candidates = self.index.span(qx as u32, qy as u32);
            if candidates.is_empty() {
                continue;
            }
            let j = candidates.start + rng.random_range(0..candidates.len());
            if tolerance.accepts(&self.features[j]) {
                out.push(j);
            }
        }
        own
    }
}

/// Per-feature acceptance window around the mean of one pixel's samples.
struct Tolerance {
    mean: [f32; SCENE_LEN],
    limit: [f32; SCENE_LEN],
}

impl Tolerance {
    fn of(features: &[Features], samples: std::ops::Range<usize>) -> Self {
        let mut mean = [0.0; SCENE_LEN];
        let mut limit = [0.0; SCENE_LEN];
        for (k, feature) in SCENE.enumerate() {
            let m: Moments = samples.clone().map(|i| features[i][feature]).collect();
            let scale = match is_position_like(feature) {
                true => POSITION_TOLERANCE,
                false => FEATURE_TOLERANCE,
            };
            mean[k] = m.mean();
            limit[k] = (scale * m.std_dev()).max(TOLERANCE_FLOOR);
        }
        Tolerance { mean, limit }
    }

    fn accepts(&self, f: &Features) -> bool {
        f[SCENE]
            .iter()
            .zip(self.mean.iter().zip(&self.limit))
            .all(|(v, (m, l))| (v - m).abs() <= *l)
    }
}

/// Two independent standard normal deviates (Box-Muller).
fn gaussian_pair(rng: &mut SmallRng) -> (f32, f32) {
    let u1 = 1.0 - rng.random::<f32>();
    let u2 = rng.random::<f32>();
    let r = (-2.0 * u1.ln()).sqrt();
    let (s, c) = (TAU * u2).sin_cos();
    (r * c, r * s)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::samples::SampleBuffer;

    fn features_of(buffer: &SampleBuffer, scene: impl Fn(u32, u32) -> f32) -> Vec<Features> {
        let index = buffer.pixel_index();
        (0..buffer.len())
            .map(|i| {
                let p = index.pixel_of(i);
                let mut f = [0.0; SCENE.end];
                f[0] = p.x as f32 + 0.5;
                f[1] = p.y as f32 + 0.5;
                f[SCENE].fill(scene(p.x, p.y));
                f
            })
            .collect()
    }

    #[test]
    fn own_samples_come_first_and_neighbors_stay_in_the_box() {
        let buffer = SampleBuffer::new(21, 21, 4);
        let features = features_of(&buffer, |_, _| 1.0);
        let index = buffer.pixel_index();
        let selector = Selector {
            features: &features,
            index: &index,
            box_size: 7,
            target: 100,
        };

        let mut rng = SmallRng::seed_from_u64(1);
        let mut out = vec![];
        let own = selector.select(10, 10, &mut rng, &mut out);

        assert_eq!(own, 4);
        assert_eq!(&out[..4], &index.span(10, 10).collect::<Vec<_>>()[..]);
        assert!(out.len() > own && out.len() <= 100);
        for &j in &out[own..] {
            let p = index.pixel_of(j);
            assert!(p.x.abs_diff(10) <= 3 && p.y.abs_diff(10) <= 3);
            assert_ne!((p.x, p.y), (10, 10));
        }
    }

    #[test]
    fn dissimilar_geometry_is_rejected() {
        let buffer = SampleBuffer::new(9, 9, 2);
        let features = features_of(&buffer, |x, _| if x < 5 { 0.0 } else { 10.0 });
        let index = buffer.pixel_index();
        let selector = Selector {
            features: &features,
            index: &index,
            box_size: 9,
            target: 200,
        };

        let mut rng = SmallRng::seed_from_u64(2);
        let mut out = vec![];
        selector.select(2, 4, &mut rng, &mut out);
        assert!(out.iter().all(|&j| index.pixel_of(j).x < 5));
    }

    #[test]
    fn gaussian_deviates_have_unit_spread() {
        let mut rng = SmallRng::seed_from_u64(3);
        let m: Moments = (0..20_000)
            .flat_map(|_| {
                let (a, b) = gaussian_pair(&mut rng);
                [a, b]
            })
            .collect();
        assert!(m.mean().abs() < 0.03);
        assert!((m.std_dev() - 1.0).abs() < 0.03);
    }
}

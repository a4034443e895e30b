use std::ops::Range;

use glam::Vec3;

use super::features::{COLOR, FEATURES, Features, POSITION, RANDOM, SCENE, SCENE_LEN};
use crate::options::WeightFormula;
use crate::stats::{MutualInformation, normalize, quantize};

/// Lower bound for `1 - W_r` when it divides the filter variance.
const MIN_SPATIAL_SHARE: f32 = 1e-3;

/// How strongly color and each scene feature take part in the bilateral weights.
#[derive(Clone, Debug, PartialEq)]
pub struct Dependencies {
    /// Share of the color dependency explained by the random parameters.
    pub w_r: f32,
    pub alpha: f32,
    pub beta: [f32; SCENE_LEN],
}

impl WeightFormula {
    /// Factor applied to `W_r` before it is subtracted from one.
    fn falloff(self, iteration: u32) -> f32 {
        match self {
            WeightFormula::Paper => 1.0,
            WeightFormula::TechReport => 1.0 + 0.1 * iteration as f32,
        }
    }
}

/// Column-major matrix of one normalized neighborhood plus its quantized copy.
pub struct Workspace {
    rows: usize,
    columns: Vec<f32>,
    bins: Vec<u8>,
    mi: MutualInformation,
}

impl Workspace {
    pub fn new(buckets: usize) -> Self {
        Workspace {
            rows: 0,
            columns: vec![],
            bins: vec![],
            mi: MutualInformation::new(buckets),
        }
    }

    pub fn load(&mut self, features: &[Features], colors: &[Vec3], samples: &[usize]) {
        let n = samples.len();
        self.rows = n;
        self.columns.resize(FEATURES * n, 0.0);
        self.bins.resize(FEATURES * n, 0);

        for (r, &j) in samples.iter().enumerate() {
            for (k, &v) in features[j].iter().enumerate() {
                self.columns[k * n + r] = v;
            }
            for (k, v) in COLOR.zip(colors[j].to_array()) {
                self.columns[k * n + r] = v;
            }
        }

        let buckets = self.mi.buckets();
        let columns = self.columns.chunks_mut(n.max(1));
        for (column, bins) in columns.zip(self.bins.chunks_mut(n.max(1))) {
            normalize(column);
            quantize(column, buckets, bins);
        }
    }

    fn column(&self, k: usize) -> &[f32] {
        &self.columns[k * self.rows..(k + 1) * self.rows]
    }

    /// Summed pairwise mutual information between two groups of attributes.
    fn dependency(&mut self, a: Range<usize>, b: Range<usize>) -> f32 {
        let n = self.rows;
        let mut total = 0.0;
        for i in a {
            for j in b.clone() {
                total += self
                    .mi
                    .compute(&self.bins[i * n..(i + 1) * n], &self.bins[j * n..(j + 1) * n]);
            }
        }
        total
    }

    pub fn dependencies(&mut self, iteration: u32, formula: WeightFormula) -> Dependencies {
        let d_rc = self.dependency(RANDOM, COLOR);
        let d_pc = self.dependency(POSITION, COLOR);
        let w_r = ratio(d_rc, d_rc + d_pc);
        let falloff = formula.falloff(iteration);

        let mut d_fc = 0.0;
        let mut color_share = [0.0; SCENE_LEN];
        let mut random_share = [0.0; SCENE_LEN];
        for (k, f) in SCENE.enumerate() {
            let d_c = self.dependency(f..f + 1, COLOR);
            let d_r = self.dependency(f..f + 1, RANDOM);
            let d_p = self.dependency(f..f + 1, POSITION);
            d_fc += d_c;
            color_share[k] = d_c;
            random_share[k] = ratio(d_r, d_r + d_p);
        }

        let total = d_rc + d_pc + d_fc;
        let mut beta = [0.0; SCENE_LEN];
        for k in 0..SCENE_LEN {
            let w_c = ratio(color_share[k], total);
            beta[k] = w_c * (1.0 - falloff * random_share[k]).max(0.0);
        }

        Dependencies {
            w_r,
            alpha: (1.0 - falloff * w_r).max(0.0),
            beta,
        }
    }

    /// Bilateral average over the loaded neighborhood for each of its first `own` rows.
    /// `noise` is the per-scene constant `J`.
    pub fn filter(
        &self,
        deps: &Dependencies,
        own: usize,
        noise: f32,
        colors: &[Vec3],
        samples: &[usize],
        out: &mut Vec<Vec3>,
    ) {
        out.clear();
        let spatial = (1.0 - deps.w_r).max(MIN_SPATIAL_SHARE);
        let variance = 8.0 * noise / own as f32 / (spatial * spatial);
        let inv = 1.0 / (2.0 * variance);

        let color_columns: Vec<&[f32]> = COLOR.map(|k| self.column(k)).collect();
        let scene_columns: Vec<(&[f32], f32)> = SCENE
            .zip(deps.beta)
            .filter(|&(_, b)| b > 0.0)
            .map(|(k, b)| (self.column(k), b))
            .collect();

        for i in 0..own {
            let mut sum = Vec3::ZERO;
            let mut total = 0.0;
            for (r, &j) in samples.iter().enumerate() {
                let dc: f32 = color_columns.iter().map(|c| (c[i] - c[r]).powi(2)).sum();
                let df: f32 = scene_columns
                    .iter()
                    .map(|(c, b)| b * (c[i] - c[r]).powi(2))
                    .sum();
                let w = (-(deps.alpha * dc + df) * inv).exp();
                sum += colors[j] * w;
                total += w;
            }
            out.push(match total > 0.0 {
                true => sum / total,
                false => colors[samples[i]],
            });
        }
    }
}

fn ratio(part: f32, whole: f32) -> f32 {
    if whole > 0.0 { part / whole } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::DEFAULT_BUCKETS;

    /// A neighborhood whose color follows `color_of(random, position)`.
    fn neighborhood(color_of: impl Fn(f32, f32) -> f32) -> (Vec<Features>, Vec<Vec3>) {
        let mut features = vec![];
        let mut colors = vec![];
        for i in 0..400 {
            let random = (i % 20) as f32 / 20.0;
            let position = (i / 20) as f32;
            let mut f = [0.0; SCENE.end];
            f[0] = position;
            f[1] = position * 0.5;
            f[RANDOM.start] = random;
            features.push(f);
            colors.push(Vec3::splat(color_of(random, position)));
        }
        (features, colors)
    }

    fn dependencies_of(color_of: impl Fn(f32, f32) -> f32, formula: WeightFormula) -> Dependencies {
        let (features, colors) = neighborhood(color_of);
        let samples: Vec<usize> = (0..features.len()).collect();
        let mut ws = Workspace::new(DEFAULT_BUCKETS);
        ws.load(&features, &colors, &samples);
        ws.dependencies(2, formula)
    }

    #[test]
    fn noise_driven_color_lowers_alpha() {
        let deps = dependencies_of(|random, _| random, WeightFormula::Paper);
        assert!(deps.w_r > 0.9, "{deps:?}");
        assert!(deps.alpha < 0.1);

        let deps = dependencies_of(|_, position| position, WeightFormula::Paper);
        assert!(deps.w_r < 0.1, "{deps:?}");
        assert!(deps.alpha > 0.9);
    }

    #[test]
    fn tech_report_formula_is_stricter_than_paper() {
        // The two published weightings differ only in how W_r is scaled per iteration.
        let mixed = |random: f32, position: f32| random + position / 20.0;
        let paper = dependencies_of(mixed, WeightFormula::Paper);
        let tech = dependencies_of(mixed, WeightFormula::TechReport);
        assert_eq!(paper.w_r, tech.w_r);
        assert!((paper.alpha - (1.0 - paper.w_r)).abs() < 1e-6);
        assert!((tech.alpha - (1.0 - 1.2 * tech.w_r).max(0.0)).abs() < 1e-6);
        assert!(tech.alpha <= paper.alpha);
    }

    #[test]
    fn beta_follows_geometry_that_explains_color() {
        // Hit x tracks the screen position and the color; the normal x tracks the lens.
        let hit_x = SCENE.start;
        let normal_x = SCENE.start + 3;
        let (mut features, colors) = neighborhood(|_, position| position);
        for f in &mut features {
            f[hit_x] = f[0] * 3.0;
            f[normal_x] = f[RANDOM.start];
        }
        let samples: Vec<usize> = (0..features.len()).collect();
        let mut ws = Workspace::new(DEFAULT_BUCKETS);
        ws.load(&features, &colors, &samples);
        let deps = ws.dependencies(0, WeightFormula::Paper);

        assert!(deps.beta[0] > 0.1, "{deps:?}");
        assert!(deps.beta[3] < 1e-3, "{deps:?}");
        for k in [1, 2, 4, 5, 12] {
            assert_eq!(deps.beta[k], 0.0, "constant feature {k}");
        }
    }

    #[test]
    fn constant_neighborhood_filters_to_itself() {
        let features = vec![[0.0; SCENE.end]; 6];
        let colors = vec![Vec3::new(0.25, 0.5, 0.75); 6];
        let samples: Vec<usize> = (0..6).collect();
        let mut ws = Workspace::new(DEFAULT_BUCKETS);
        ws.load(&features, &colors, &samples);
        let deps = ws.dependencies(0, WeightFormula::TechReport);
        assert_eq!(deps.alpha, 1.0);
        assert_eq!(deps.beta, [0.0; SCENE_LEN]);

        let mut out = vec![];
        ws.filter(&deps, 3, 0.02, &colors, &samples, &mut out);
        assert_eq!(out, vec![Vec3::new(0.25, 0.5, 0.75); 3]);
    }
}

//! Statistics over one-dimensional float signals.
//!
//! Every routine works on plain slices so any contiguous sub-range of a feature matrix can be
//! analysed as a signal of its own.

pub const DEFAULT_BUCKETS: usize = 10;

/// Streaming first and second moments, accumulated in `f64`.
#[derive(Copy, Clone, Debug, Default)]
pub struct Moments {
    pub n: u64,
    pub sum: f64,
    pub sum_sq: f64,
}

impl Moments {
    pub fn push(&mut self, value: f32) {
        let v = value as f64;
        self.n += 1;
        self.sum += v;
        self.sum_sq += v * v;
    }

    pub fn merge(self, other: Moments) -> Moments {
        Moments {
            n: self.n + other.n,
            sum: self.sum + other.sum,
            sum_sq: self.sum_sq + other.sum_sq,
        }
    }

    pub fn mean(&self) -> f32 {
        if self.n == 0 {
            return 0.0;
        }
        (self.sum / self.n as f64) as f32
    }

    pub fn variance(&self) -> f32 {
        if self.n == 0 {
            return 0.0;
        }
        let mean = self.sum / self.n as f64;
        (self.sum_sq / self.n as f64 - mean * mean).max(0.0) as f32
    }

    pub fn std_dev(&self) -> f32 {
        self.variance().sqrt()
    }
}

impl FromIterator<f32> for Moments {
    fn from_iter<I: IntoIterator<Item = f32>>(iter: I) -> Self {
        let mut m = Moments::default();
        iter.into_iter().for_each(|v| m.push(v));
        m
    }
}

/// Population mean and standard deviation of `values` (two-pass).
pub fn mean_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    (mean, var.sqrt())
}

/// Rescales `values` in place to zero mean and unit variance. Constant signals become zero.
pub fn normalize(values: &mut [f32]) {
    let (mean, std) = mean_std(values);
    if std > 0.0 {
        values.iter_mut().for_each(|v| *v = (*v - mean) / std);
    } else {
        values.fill(0.0);
    }
}

/// Maps `values` onto `buckets` equal-width bins spanning their range.
pub fn quantize(values: &[f32], buckets: usize, out: &mut [u8]) {
    debug_assert!(buckets > 0 && buckets <= 256);
    debug_assert_eq!(values.len(), out.len());

    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;
    if !(range.is_finite() && range > 0.0) {
        out.fill(0);
        return;
    }

    let scale = buckets as f32 / range;
    let last = (buckets - 1) as f32;
    for (o, &v) in out.iter_mut().zip(values) {
        *o = ((v - min) * scale).clamp(0.0, last) as u8;
    }
}

/// Reusable joint histogram for mutual information between quantized signals.
pub struct MutualInformation {
    buckets: usize,
    joint: Vec<u32>,
    marginal_a: Vec<u32>,
    marginal_b: Vec<u32>,
}

impl MutualInformation {
    pub fn new(buckets: usize) -> Self {
        MutualInformation {
            buckets,
            joint: vec![0; buckets * buckets],
            marginal_a: vec![0; buckets],
            marginal_b: vec![0; buckets],
        }
    }

    pub fn buckets(&self) -> usize {
        self.buckets
    }

    /// `I(A;B)` in nats for two quantized signals of equal length.
    pub fn compute(&mut self, a: &[u8], b: &[u8]) -> f32 {
        debug_assert_eq!(a.len(), b.len());
        if a.is_empty() {
            return 0.0;
        }

        self.joint.fill(0);
        self.marginal_a.fill(0);
        self.marginal_b.fill(0);

        for (&x, &y) in a.iter().zip(b) {
            self.joint[x as usize * self.buckets + y as usize] += 1;
            self.marginal_a[x as usize] += 1;
            self.marginal_b[y as usize] += 1;
        }

        let n = a.len() as f32;
        let mut mi = 0.0;
        for x in 0..self.buckets {
            let pa = self.marginal_a[x];
            if pa == 0 {
                continue;
            }
            for y in 0..self.buckets {
                let pxy = self.joint[x * self.buckets + y];
                if pxy == 0 {
                    continue;
                }
                let pb = self.marginal_b[y];
                // p(x,y) * ln(p(x,y) / (p(x) p(y))) with counts
                mi += pxy as f32 / n * (pxy as f32 * n / (pa as f32 * pb as f32)).ln();
            }
        }
        mi.max(0.0)
    }
}

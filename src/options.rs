use glam::Vec4;

use crate::error::{ReconError, ReconResult};

/// Which dependency-to-weight mapping RPF uses.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum WeightFormula {
    /// `α = 1 - W_r`, `β_k = W_c,k (1 - W_r,k)`.
    Paper,
    /// Same as `Paper` with `W_r` scaled by `1 + 0.1·iteration` and clamped at zero.
    #[default]
    TechReport,
}

/// How the post-filter outlier clamp decides a sample is an outlier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ClampMode {
    /// Each color channel independently. Can shift hue.
    #[default]
    PerChannel,
    /// Whole color vector, judged by luminance.
    Luminance,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum AlbedoMode {
    #[default]
    Keep,
    /// Filter `color / albedo` and multiply the albedo back in at the end.
    Demodulate,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum AtrousSignal {
    #[default]
    Radiance,
    /// Replace the color with the binary `AMBIENT_OCCLUSION` channel.
    AmbientOcclusion,
}

/// Per-scene tuning presets.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ScenePreset {
    #[default]
    Default,
    /// Little noise, strong geometric edges.
    Sharp,
    /// Heavy noise, e.g. depth of field or soft shadows.
    Soft,
}

impl ScenePreset {
    pub fn rpf(self) -> RpfOptions {
        let mut options = RpfOptions::default();
        match self {
            ScenePreset::Default => {}
            ScenePreset::Sharp => options.noise = 0.01,
            ScenePreset::Soft => {
                for it in &mut options.iterations {
                    it.neighbor_fraction = (it.neighbor_fraction * 2.0).min(1.0);
                }
            }
        }
        options
    }

    pub fn atrous(self) -> AtrousOptions {
        let tuning = match self {
            ScenePreset::Default => AtrousTuning::default(),
            ScenePreset::Sharp => AtrousTuning {
                color: 0.5,
                normal: 0.1,
                position: 0.05,
                ..AtrousTuning::default()
            },
            ScenePreset::Soft => AtrousTuning {
                color: 2.0,
                max_color_sigma: 4.0,
                ..AtrousTuning::default()
            },
        };
        AtrousOptions {
            tuning,
            ..AtrousOptions::default()
        }
    }
}

/// One RPF pass.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RpfIteration {
    /// Neighborhood box width in pixels.
    pub box_size: u32,
    /// Neighborhood size as a fraction of `box_size² · spp`.
    pub neighbor_fraction: f32,
}

impl RpfIteration {
    pub const fn new(box_size: u32, neighbor_fraction: f32) -> Self {
        RpfIteration {
            box_size,
            neighbor_fraction,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RpfOptions {
    pub iterations: Vec<RpfIteration>,
    /// Per-scene noise constant `J`.
    pub noise: f32,
    pub weight_formula: WeightFormula,
    pub outlier_clamp: Option<ClampMode>,
    pub albedo: AlbedoMode,
    pub mi_buckets: usize,
    pub seed: u64,
    pub background: Vec4,
}

impl Default for RpfOptions {
    fn default() -> Self {
        Self {
            iterations: vec![
                RpfIteration::new(55, 0.02),
                RpfIteration::new(35, 0.04),
                RpfIteration::new(17, 0.3),
                RpfIteration::new(7, 0.5),
            ],
            noise: 0.02,
            weight_formula: WeightFormula::default(),
            outlier_clamp: Some(ClampMode::default()),
            albedo: AlbedoMode::default(),
            mi_buckets: crate::stats::DEFAULT_BUCKETS,
            seed: 0,
            background: Vec4::new(1.0, 0.0, 1.0, 1.0),
        }
    }
}

impl RpfOptions {
    pub fn validate(&self) -> ReconResult<()> {
        if self.iterations.is_empty() {
            return Err(ReconError::config("RPF needs at least one iteration"));
        }
        for it in &self.iterations {
            if it.box_size == 0 {
                return Err(ReconError::config("RPF box sizes must be positive"));
            }
            if !(it.neighbor_fraction > 0.0 && it.neighbor_fraction <= 1.0) {
                return Err(ReconError::config(format!(
                    "neighbor fraction {} outside (0, 1]",
                    it.neighbor_fraction
                )));
            }
        }
        if !(self.noise > 0.0 && self.noise.is_finite()) {
            return Err(ReconError::config("noise constant must be positive"));
        }
        if !(2..=256).contains(&self.mi_buckets) {
            return Err(ReconError::config("mutual information needs 2..=256 buckets"));
        }
        Ok(())
    }
}

/// Which feature distances take part in the À-Trous weights.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EdgeStops {
    pub screen: bool,
    pub color: bool,
    pub normal: bool,
    pub position: bool,
    pub secondary_normal: bool,
    pub secondary_position: bool,
}

impl Default for EdgeStops {
    fn default() -> Self {
        Self {
            screen: true,
            color: true,
            normal: true,
            position: true,
            secondary_normal: false,
            secondary_position: false,
        }
    }
}

impl EdgeStops {
    pub const NONE: EdgeStops = EdgeStops {
        screen: false,
        color: false,
        normal: false,
        position: false,
        secondary_normal: false,
        secondary_position: false,
    };
}

/// Initial Gaussian widths as multiples of the global standard deviation of each feature.
/// `screen` is absolute, in grid steps (pixels at the first iteration).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AtrousTuning {
    pub screen: f32,
    pub color: f32,
    pub normal: f32,
    pub position: f32,
    pub secondary_normal: f32,
    pub secondary_position: f32,
    pub max_color_sigma: f32,
}

impl Default for AtrousTuning {
    fn default() -> Self {
        Self {
            screen: 2.0,
            color: 1.0,
            normal: 0.3,
            position: 0.1,
            secondary_normal: 0.5,
            secondary_position: 0.2,
            max_color_sigma: 1.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AtrousOptions {
    pub iterations: u32,
    /// Kernel half-width; 2 gives a 5×5 footprint.
    pub radius: u32,
    pub jitter: bool,
    pub stops: EdgeStops,
    pub tuning: AtrousTuning,
    pub albedo: AlbedoMode,
    pub signal: AtrousSignal,
    pub smoothed_normals: bool,
    pub seed: u64,
    pub background: Vec4,
}

impl Default for AtrousOptions {
    fn default() -> Self {
        Self {
            iterations: 5,
            radius: 2,
            jitter: true,
            stops: EdgeStops::default(),
            tuning: AtrousTuning::default(),
            albedo: AlbedoMode::default(),
            signal: AtrousSignal::default(),
            smoothed_normals: false,
            seed: 0,
            background: Vec4::new(1.0, 0.0, 1.0, 1.0),
        }
    }
}

impl AtrousOptions {
    pub fn validate(&self) -> ReconResult<()> {
        if self.iterations > 16 {
            return Err(ReconError::config("at most 16 À-Trous iterations are supported"));
        }
        let t = &self.tuning;
        let sigmas = [
            t.screen,
            t.color,
            t.normal,
            t.position,
            t.secondary_normal,
            t.secondary_position,
            t.max_color_sigma,
        ];
        if sigmas.iter().any(|s| !(*s > 0.0 && s.is_finite())) {
            return Err(ReconError::config("À-Trous tuning constants must be positive"));
        }
        Ok(())
    }
}

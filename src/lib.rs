//! Adaptive reconstruction of Monte Carlo sample buffers.
//!
//! A renderer's per-sample output is loaded into a [`SampleBuffer`] and filtered by one of the
//! [`Reconstruction`] implementations: random parameter filtering ([`Rpf`]), an edge-avoiding
//! À-Trous wavelet filter ([`Atrous`]) or plain per-pixel averaging. Row-parallel work runs
//! on a [`TaskPool`] through per-caller [`MulticoreLauncher`] queues.

pub mod atrous;
pub mod error;
pub mod film;
pub mod launcher;
pub mod loader;
pub mod options;
pub mod reconstruct;
pub mod rpf;
pub mod samples;
pub mod stats;

pub use atrous::Atrous;
pub use error::{ReconError, ReconResult};
pub use film::{FilterReport, FilteredSamples, ImageSink, to_srgb8};
pub use launcher::{LauncherHandle, MulticoreLauncher, Task, TaskPool};
pub use loader::{Format, load_samples, read_samples, save_samples, write_samples};
pub use options::{
    AlbedoMode, AtrousOptions, AtrousSignal, AtrousTuning, ClampMode, EdgeStops, RpfIteration,
    RpfOptions, ScenePreset, WeightFormula,
};
pub use reconstruct::{BoxReconstruction, Reconstruction};
pub use rpf::Rpf;
pub use samples::{ChannelId, ChannelKind, PixelIndex, SampleBuffer};

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use glam::{Vec3, Vec4};
use image::{DynamicImage, Rgba32FImage};
use ordered_float::OrderedFloat;
use tracing::Level;

use sample_recon::{
    AlbedoMode, Atrous, AtrousSignal, BoxReconstruction, Reconstruction, Rpf, ScenePreset,
    TaskPool, WeightFormula, load_samples, to_srgb8,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum FilterKind {
    Rpf,
    Atrous,
    Box,
}

#[derive(Parser)]
struct Options {
    #[clap(short, long, value_enum, default_value = "rpf")]
    filter: FilterKind,

    #[clap(short = 'j', long)]
    threads: Option<usize>,

    #[clap(long, value_enum, default_value = "default")]
    preset: ScenePreset,

    /// À-Trous passes, or how many entries of the RPF box schedule to run.
    #[clap(short, long)]
    iterations: Option<u32>,

    #[clap(long, default_value = "0")]
    seed: u64,

    #[clap(long)]
    no_clamp: bool,

    #[clap(long)]
    paper_weights: bool,

    #[clap(long)]
    demodulate: bool,

    /// Filter the binary AMBIENT_OCCLUSION channel instead of radiance (À-Trous only).
    #[clap(long)]
    ambient_occlusion: bool,

    /// Use screen-space smoothed normals for the normal edge stop (À-Trous only).
    #[clap(long)]
    smooth_normals: bool,

    #[clap(long)]
    no_jitter: bool,

    #[clap(long, default_value = "1")]
    scale: f32,

    /// Pick the exposure so the 99th percentile pixel maps to white. Ignores `--scale`.
    #[clap(long)]
    auto_scale: bool,

    /// `.exr` and `.hdr` keep linear floats; anything else is written as 8-bit sRGB.
    #[clap(short, long, default_value = "img.png")]
    output: PathBuf,

    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    samples: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let options = Options::parse();

    let level = match options.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let pool = TaskPool::global();
    if let Some(threads) = options.threads {
        pool.set_num_threads(threads);
    }

    let (filter, background) = build_filter(&options)?;

    let start = Instant::now();
    let mut buffer = load_samples(&options.samples)
        .with_context(|| format!("failed to load {}", options.samples.display()))?;
    let loaded = start.elapsed();

    filter
        .prepare(&mut buffer)
        .with_context(|| format!("{} could not prepare the sample buffer", filter.name()))?;
    let filtered = filter
        .filter(&buffer, pool)
        .with_context(|| format!("{} failed", filter.name()))?;

    let mut image = Rgba32FImage::new(buffer.width(), buffer.height());
    filtered.resolve(&buffer.pixel_index(), buffer.weights(), &mut image, background);

    let report = &filtered.report;
    println!(
        "Loaded {} samples ({}x{}) in {:.2} seconds",
        buffer.len(),
        buffer.width(),
        buffer.height(),
        loaded.as_secs_f64()
    );
    println!(
        "{} took {:.2} seconds",
        filter.name(),
        report.elapsed.as_secs_f64()
    );
    println!(
        "Scene energy: {:.4} -> {:.4} ({:.4}% change)",
        report.input_energy,
        report.output_energy,
        report.relative_energy_change() * 100.0
    );

    save_image(image, &options)
}

fn build_filter(options: &Options) -> anyhow::Result<(Box<dyn Reconstruction>, Vec4)> {
    let albedo = match options.demodulate {
        true => AlbedoMode::Demodulate,
        false => AlbedoMode::Keep,
    };

    Ok(match options.filter {
        FilterKind::Rpf => {
            let mut rpf = options.preset.rpf();
            if let Some(n) = options.iterations {
                rpf.iterations.truncate(n as usize);
            }
            if options.no_clamp {
                rpf.outlier_clamp = None;
            }
            if options.paper_weights {
                rpf.weight_formula = WeightFormula::Paper;
            }
            rpf.albedo = albedo;
            rpf.seed = options.seed;
            let background = rpf.background;
            let filter: Box<dyn Reconstruction> = Box::new(Rpf::new(rpf)?);
            (filter, background)
        }
        FilterKind::Atrous => {
            let mut atrous = options.preset.atrous();
            if let Some(n) = options.iterations {
                atrous.iterations = n;
            }
            if options.ambient_occlusion {
                atrous.signal = AtrousSignal::AmbientOcclusion;
            }
            atrous.jitter = !options.no_jitter;
            atrous.smoothed_normals = options.smooth_normals;
            atrous.albedo = albedo;
            atrous.seed = options.seed;
            let background = atrous.background;
            let filter: Box<dyn Reconstruction> = Box::new(Atrous::new(atrous)?);
            (filter, background)
        }
        FilterKind::Box => {
            let filter: Box<dyn Reconstruction> = Box::new(BoxReconstruction);
            (filter, options.preset.rpf().background)
        }
    })
}

fn save_image(image: Rgba32FImage, options: &Options) -> anyhow::Result<()> {
    let path = &options.output;
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase());

    match extension.as_deref() {
        Some("exr") => image.save(path),
        Some("hdr") => DynamicImage::ImageRgba32F(image).into_rgb32f().save(path),
        _ => {
            let scale = match options.auto_scale {
                true => auto_scale(&image),
                false => options.scale,
            };
            to_srgb8(&image, scale).save(path)
        }
    }
    .with_context(|| format!("failed to write {}", path.display()))
}

/// Exposure that maps the 99th percentile luminance to one.
fn auto_scale(image: &Rgba32FImage) -> f32 {
    const LUMINANCE: Vec3 = Vec3::new(0.2126, 0.7152, 0.0722);

    let mut luminance: Vec<f32> = image
        .pixels()
        .map(|p| Vec4::from_array(p.0).truncate().dot(LUMINANCE))
        .filter(|l| l.is_finite())
        .collect();
    if luminance.is_empty() {
        return 1.0;
    }

    let k = (luminance.len() - 1) * 99 / 100;
    let (_, &mut bright, _) = luminance.select_nth_unstable_by_key(k, |&l| OrderedFloat(l));
    if bright > 0.0 { 1.0 / bright } else { 1.0 }
}

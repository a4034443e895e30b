use glam::{Vec2, Vec3, Vec4};
use image::Rgba32FImage;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sample_recon::samples::{ALBEDO, PRIMARY_HIT, PRIMARY_NORMAL};
use sample_recon::{
    AlbedoMode, Atrous, AtrousOptions, BoxReconstruction, EdgeStops, FilteredSamples,
    ReconError, Reconstruction, Rpf, RpfIteration, RpfOptions, SampleBuffer, TaskPool,
};

const RED: Vec3 = Vec3::new(0.8, 0.1, 0.1);
const BLUE: Vec3 = Vec3::new(0.1, 0.2, 0.9);

fn rpf_options() -> RpfOptions {
    RpfOptions {
        iterations: vec![RpfIteration::new(7, 0.5), RpfIteration::new(3, 0.5)],
        ..RpfOptions::default()
    }
}

/// Two flat walls meeting at `x = width / 2`, every sample of a pixel identical.
fn two_walls(width: u32, height: u32, spp: u32) -> SampleBuffer {
    let mut buffer = SampleBuffer::new(width, height, spp);
    let mut hits = vec![];
    let mut normals = vec![];
    for y in 0..height {
        for x in 0..width {
            for i in 0..spp {
                let left = x < width / 2;
                let color = if left { RED } else { BLUE };
                buffer.set_sample_color(x, y, i, color.extend(1.0));
                hits.push(if left { Vec3::ZERO } else { Vec3::new(5.0, 0.0, 0.0) });
                normals.push(if left { Vec3::Z } else { Vec3::X });
            }
        }
    }
    let n = buffer.len();
    buffer.insert_channel(PRIMARY_HIT, hits).unwrap();
    buffer.insert_channel(PRIMARY_NORMAL, normals).unwrap();
    buffer.insert_channel(ALBEDO, vec![Vec3::splat(0.5); n]).unwrap();
    buffer
}

/// One flat wall with independent uniform noise on every sample.
fn noisy_wall(width: u32, height: u32, spp: u32, seed: u64) -> SampleBuffer {
    let mut buffer = SampleBuffer::new(width, height, spp);
    let mut rng = SmallRng::seed_from_u64(seed);
    for y in 0..height {
        for x in 0..width {
            for i in 0..spp {
                let color = Vec3::new(rng.random(), rng.random(), rng.random());
                buffer.set_sample_color(x, y, i, color.extend(1.0));
            }
        }
    }
    let n = buffer.len();
    buffer.insert_channel(PRIMARY_HIT, vec![Vec3::ONE; n]).unwrap();
    buffer.insert_channel(PRIMARY_NORMAL, vec![Vec3::Y; n]).unwrap();
    buffer.insert_channel(ALBEDO, vec![Vec3::splat(0.7); n]).unwrap();
    buffer
}

/// One flat wall seen through a wide lens: color depends only on the lens position `u`.
fn defocused_wall(width: u32, height: u32, spp: u32, seed: u64) -> SampleBuffer {
    let mut buffer = SampleBuffer::new(width, height, spp);
    let mut rng = SmallRng::seed_from_u64(seed);
    for y in 0..height {
        for x in 0..width {
            for i in 0..spp {
                let offset = Vec2::new(rng.random(), rng.random());
                let u: f32 = rng.random_range(-1.0..1.0);
                let v: f32 = rng.random_range(-1.0..1.0);
                buffer.set_sample_xy(x, y, i, Vec2::new(x as f32, y as f32) + offset);
                buffer.set_sample_uv(x, y, i, Vec2::new(u, v));
                let color = Vec3::splat(0.5 + 0.4 * u);
                buffer.set_sample_color(x, y, i, color.extend(1.0));
            }
        }
    }
    let n = buffer.len();
    buffer.insert_channel(PRIMARY_HIT, vec![Vec3::ONE; n]).unwrap();
    buffer.insert_channel(PRIMARY_NORMAL, vec![Vec3::Y; n]).unwrap();
    buffer.insert_channel(ALBEDO, vec![Vec3::splat(0.7); n]).unwrap();
    buffer
}

fn assert_unchanged(buffer: &SampleBuffer, filtered: &FilteredSamples) {
    for i in 0..buffer.len() {
        let expected = buffer.colors()[i].truncate();
        let got = filtered.color(i);
        assert!(
            (got - expected).abs().max_element() < 1e-4,
            "sample {i}: expected {expected}, got {got}"
        );
    }
}

/// Variance of the per-pixel means around their average.
fn pixel_variance(buffer: &SampleBuffer, color: impl Fn(usize) -> Vec3) -> f32 {
    let index = buffer.pixel_index();
    let means: Vec<Vec3> = (0..buffer.height())
        .flat_map(|y| (0..buffer.width()).map(move |x| (x, y)))
        .map(|(x, y)| {
            let span = index.span(x, y);
            let n = span.len() as f32;
            span.map(&color).sum::<Vec3>() / n
        })
        .collect();
    let mean = means.iter().sum::<Vec3>() / means.len() as f32;
    means.iter().map(|m| (*m - mean).length_squared()).sum::<f32>() / means.len() as f32
}

#[test]
fn rpf_leaves_noise_free_input_alone() {
    let buffer = two_walls(8, 6, 4);
    let pool = TaskPool::new(3);

    for albedo in [AlbedoMode::Keep, AlbedoMode::Demodulate] {
        let rpf = Rpf::new(RpfOptions {
            albedo,
            ..rpf_options()
        })
        .unwrap();
        let filtered = rpf.filter(&buffer, &pool).unwrap();
        assert_unchanged(&buffer, &filtered);
        assert!(filtered.report.relative_energy_change() < 1e-4);
    }
}

#[test]
fn atrous_leaves_noise_free_input_alone() {
    let buffer = two_walls(8, 6, 4);
    let atrous = Atrous::new(AtrousOptions::default()).unwrap();
    let filtered = atrous.filter(&buffer, &TaskPool::new(2)).unwrap();
    assert_unchanged(&buffer, &filtered);
}

#[test]
fn box_reconstruction_is_the_identity() {
    let buffer = noisy_wall(4, 4, 3, 11);
    let filtered = BoxReconstruction.filter(&buffer, &TaskPool::new(1)).unwrap();
    assert_unchanged(&buffer, &filtered);
    assert_eq!(filtered.report.input_energy, filtered.report.output_energy);
}

#[test]
fn filters_keep_the_energy_of_a_flat_scene() {
    let buffer = noisy_wall(12, 12, 4, 7);
    let pool = TaskPool::new(4);

    let filters: Vec<Box<dyn Reconstruction>> = vec![
        Box::new(Rpf::new(rpf_options()).unwrap()),
        Box::new(Atrous::new(AtrousOptions::default()).unwrap()),
    ];
    for filter in filters {
        let filtered = filter.filter(&buffer, &pool).unwrap();
        let change = filtered.report.relative_energy_change();
        assert!(change < 0.05, "{} changed energy by {change}", filter.name());
    }
}

#[test]
fn atrous_smooths_a_noisy_wall() {
    let buffer = noisy_wall(12, 12, 4, 8);
    let before = pixel_variance(&buffer, |i| buffer.colors()[i].truncate());

    let atrous = Atrous::new(AtrousOptions::default()).unwrap();
    let filtered = atrous.filter(&buffer, &TaskPool::new(2)).unwrap();
    let after = pixel_variance(&buffer, |i| filtered.color(i));
    assert!(after < 0.5 * before, "variance {before} -> {after}");
}

#[test]
fn rpf_removes_lens_noise() {
    let buffer = defocused_wall(12, 12, 8, 21);
    let before = pixel_variance(&buffer, |i| buffer.colors()[i].truncate());

    let filtered = Rpf::new(rpf_options())
        .unwrap()
        .filter(&buffer, &TaskPool::new(4))
        .unwrap();
    let after = pixel_variance(&buffer, |i| filtered.color(i));
    assert!(after < 0.5 * before, "variance {before} -> {after}");
    assert!(filtered.report.relative_energy_change() < 0.05);
}

#[test]
fn atrous_averages_a_half_red_block_to_pink() {
    let mut buffer = SampleBuffer::new(2, 2, 4);
    for y in 0..2 {
        for x in 0..2 {
            for i in 0..4 {
                let color = if i % 2 == 0 { Vec3::X } else { Vec3::ZERO };
                buffer.set_sample_color(x, y, i, color.extend(1.0));
            }
        }
    }
    let n = buffer.len();
    buffer.insert_channel(PRIMARY_HIT, vec![Vec3::ONE; n]).unwrap();
    buffer.insert_channel(PRIMARY_NORMAL, vec![Vec3::Z; n]).unwrap();
    buffer.insert_channel(ALBEDO, vec![Vec3::ONE; n]).unwrap();

    let atrous = Atrous::new(AtrousOptions {
        iterations: 1,
        stops: EdgeStops {
            normal: true,
            position: true,
            ..EdgeStops::NONE
        },
        ..AtrousOptions::default()
    })
    .unwrap();
    let filtered = atrous.filter(&buffer, &TaskPool::new(2)).unwrap();

    let mut image = Rgba32FImage::new(2, 2);
    filtered.resolve(&buffer.pixel_index(), buffer.weights(), &mut image, Vec4::ZERO);
    for pixel in image.pixels() {
        let color = Vec4::from_array(pixel.0);
        assert!((color - Vec4::new(0.5, 0.0, 0.0, 1.0)).abs().max_element() < 1e-5);
    }
    for i in 0..n {
        assert!((filtered.color(i) - Vec3::new(0.5, 0.0, 0.0)).length() < 1e-5);
    }
}

#[test]
fn atrous_rejects_irregular_buffers() {
    let buffer = SampleBuffer::new_irregular(2, 2, &[1, 2, 0, 3]).unwrap();
    let atrous = Atrous::new(AtrousOptions::default()).unwrap();
    assert!(matches!(
        atrous.filter(&buffer, &TaskPool::new(1)),
        Err(ReconError::Config(_))
    ));
}

#[test]
fn rpf_handles_irregular_buffers_and_empty_pixels() {
    let mut buffer = SampleBuffer::new_irregular(3, 2, &[2, 3, 0, 1, 4, 2]).unwrap();
    let n = buffer.len();
    buffer.clear(Vec4::new(0.25, 0.5, 0.75, 1.0), 0.0, 0.0);
    buffer.insert_channel(PRIMARY_HIT, vec![Vec3::ZERO; n]).unwrap();
    buffer.insert_channel(PRIMARY_NORMAL, vec![Vec3::Z; n]).unwrap();
    buffer.insert_channel(ALBEDO, vec![Vec3::ONE; n]).unwrap();

    let options = rpf_options();
    let background = options.background;
    let filtered = Rpf::new(options)
        .unwrap()
        .filter(&buffer, &TaskPool::new(2))
        .unwrap();
    assert_unchanged(&buffer, &filtered);

    let mut image = Rgba32FImage::new(3, 2);
    filtered.resolve(&buffer.pixel_index(), buffer.weights(), &mut image, background);
    assert_eq!(Vec4::from_array(image.get_pixel(2, 0).0), background);
    let single = Vec4::from_array(image.get_pixel(0, 1).0);
    assert!((single - Vec4::new(0.25, 0.5, 0.75, 1.0)).abs().max_element() < 1e-5);
}

use std::time::Instant;

use glam::{Vec2, Vec3};
use rayon::prelude::*;

use crate::error::ReconResult;
use crate::samples::{ChannelId, PRIMARY_NORMAL, SMOOTHED_NORMAL, SampleBuffer};

const WINDOW: i32 = 5;
const NORMAL_SIGMA: f32 = 0.5;

impl SampleBuffer {
    /// Returns the cached `SMOOTHED_NORMAL` channel, deriving it on first use from
    /// `PRIMARY_NORMAL` with a 5×5 pixel cross-bilateral average. Non-finite normals
    /// (escaped samples) are copied through and never averaged into their neighbors.
    pub fn smoothed_normals(&mut self) -> ReconResult<ChannelId> {
        if let Some(id) = self.channel_id(SMOOTHED_NORMAL) {
            return Ok(id);
        }

        let t = Instant::now();
        let smoothed = self.compute_smoothed_normals()?;
        let id = self.insert_channel(SMOOTHED_NORMAL, smoothed)?;
        tracing::info!("Smoothed normals in {:.3?}", t.elapsed());
        Ok(id)
    }

    fn compute_smoothed_normals(&self) -> ReconResult<Vec<Vec3>> {
        let normals = self.named_channel::<Vec3>(PRIMARY_NORMAL)?;
        let xy = self.xy();

        let radius = WINDOW / 2;
        let screen_sigma = WINDOW as f32 / 4.0;
        let inv_screen = 1.0 / (2.0 * screen_sigma * screen_sigma);
        let inv_normal = 1.0 / (2.0 * NORMAL_SIGMA * NORMAL_SIGMA);

        let width = self.width() as i32;
        let height = self.height() as i32;

        let smoothed = (0..height)
            .into_par_iter()
            .flat_map_iter(|y| {
                (0..width).flat_map(move |x| {
                    self.pixel_span(x as u32, y as u32).map(move |i| {
                        let (p, n) = (xy[i], normals[i]);
                        if !n.is_finite() {
                            return n;
                        }
                        let mut sum = Vec3::ZERO;
                        for qy in (y - radius).max(0)..=(y + radius).min(height - 1) {
                            for qx in (x - radius).max(0)..=(x + radius).min(width - 1) {
                                for j in self.pixel_span(qx as u32, qy as u32) {
                                    if !normals[j].is_finite() {
                                        continue;
                                    }
                                    let d = Vec2::distance_squared(p, xy[j]) * inv_screen
                                        + n.distance_squared(normals[j]) * inv_normal;
                                    sum += normals[j] * (-d).exp();
                                }
                            }
                        }
                        sum.normalize_or_zero()
                    })
                })
            })
            .collect();

        Ok(smoothed)
    }
}

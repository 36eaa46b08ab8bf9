use cgmath::prelude::*;
use encase::ShaderType;
use image::{RgbaImage, imageops};
use rand::prelude::*;
use rayon::prelude::*;
use std::path::Path;
use thiserror::Error;

/// Sampling stride in pixels; also the side length of each particle square.
pub const DEFAULT_GAP: u32 = 5;
/// Pointer interaction threshold, compared against squared distance.
/// The effective on-screen radius is sqrt of this (~55 px).
pub const DEFAULT_RADIUS: f32 = 3000.0;
pub const DEFAULT_EASE: f32 = 0.1;
/// Looser spring used after a warp so particles drift home visibly.
pub const WARP_EASE: f32 = 0.07;
pub const FRICTION: f32 = 0.95;

#[derive(Debug, Error)]
pub enum EffectError {
    #[error("failed to decode image: {0}")]
    Image(#[from] image::ImageError),
    #[error("sampling gap must be at least 1")]
    ZeroGap,
}

#[derive(Clone, Copy, ShaderType)]
pub struct Particle {
    pub position: cgmath::Vector2<f32>,
    pub origin: cgmath::Vector2<f32>,
    pub velocity: cgmath::Vector2<f32>,
    pub color: cgmath::Vector3<f32>,
    pub ease: f32,
    pub friction: f32,
}

impl Particle {
    fn new(
        x: u32,
        y: u32,
        color: cgmath::Vector3<f32>,
        bounds: cgmath::Vector2<f32>,
        rng: &mut impl Rng,
    ) -> Self {
        Self {
            // Scattered in at random; the spring pulls it to its origin cell.
            position: cgmath::vec2(rng.gen_range(0.0..bounds.x), rng.gen_range(0.0..bounds.y)),
            origin: cgmath::vec2(x as f32, y as f32),
            velocity: cgmath::vec2(0.0, 0.0),
            color,
            ease: DEFAULT_EASE,
            friction: FRICTION,
        }
    }

    /// One integrator step: pointer impulse (if any), friction, spring to origin.
    pub fn update(&mut self, pointer: Option<cgmath::Vector2<f32>>, radius: f32) {
        if let Some(pointer) = pointer {
            let delta = pointer - self.position;
            let sqr_distance = delta.magnitude2();
            // Squared distance against the raw radius, as the effect was tuned.
            // The sqr_distance > 0.0 guard keeps a particle sitting exactly
            // under the pointer from picking up an infinite force.
            if sqr_distance > 0.0 && sqr_distance < radius {
                let force = radius / sqr_distance;
                let angle = delta.y.atan2(delta.x);
                self.velocity.x += force * angle.cos();
                self.velocity.y += force * angle.sin();
            }
        }

        self.velocity *= self.friction;
        self.position += self.velocity + (self.origin - self.position) * self.ease;
    }

    pub fn warp(&mut self, bounds: cgmath::Vector2<f32>, rng: &mut impl Rng) {
        self.position = cgmath::vec2(rng.gen_range(0.0..bounds.x), rng.gen_range(0.0..bounds.y));
        self.ease = WARP_EASE;
    }
}

/// Owns the sampled particle set and the shared pointer state.
pub struct Field {
    pub width: u32,
    pub height: u32,
    pub gap: u32,
    pub radius: f32,
    pub pointer: Option<cgmath::Vector2<f32>>,
    pub particles: Vec<Particle>,
}

impl Field {
    pub fn new(width: u32, height: u32, gap: u32, radius: f32) -> Result<Self, EffectError> {
        if gap == 0 {
            return Err(EffectError::ZeroGap);
        }
        Ok(Self {
            width,
            height,
            gap,
            radius,
            pointer: None,
            particles: Vec::new(),
        })
    }

    pub fn bounds(&self) -> cgmath::Vector2<f32> {
        cgmath::vec2(self.width as f32, self.height as f32)
    }

    /// One-time sampling pass: composite the image centered onto a transparent
    /// canvas, then spawn a particle for every grid cell with nonzero alpha.
    pub fn init(&mut self, image: &RgbaImage) {
        let mut canvas = RgbaImage::new(self.width, self.height);
        let offset_x = (self.width as i64 - image.width() as i64) / 2;
        let offset_y = (self.height as i64 - image.height() as i64) / 2;
        imageops::overlay(&mut canvas, image, offset_x, offset_y);

        let bounds = self.bounds();
        let mut rng = thread_rng();
        self.particles.clear();
        for y in (0..self.height).step_by(self.gap as usize) {
            for x in (0..self.width).step_by(self.gap as usize) {
                let [r, g, b, a] = canvas.get_pixel(x, y).0;
                if a > 0 {
                    let color =
                        cgmath::vec3(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0);
                    self.particles
                        .push(Particle::new(x, y, color, bounds, &mut rng));
                }
            }
        }
    }

    /// Particles never interact with each other, only with the shared pointer
    /// snapshot, so the per-particle update fans out freely.
    pub fn update(&mut self) {
        let pointer = self.pointer;
        let radius = self.radius;
        self.particles
            .par_iter_mut()
            .for_each(|particle| particle.update(pointer, radius));
    }

    pub fn warp(&mut self) {
        let bounds = self.bounds();
        self.particles.par_iter_mut().for_each(|particle| {
            let mut rng = thread_rng();
            particle.warp(bounds, &mut rng);
        });
    }

    pub fn set_pointer(&mut self, x: f32, y: f32) {
        self.pointer = Some(cgmath::vec2(x, y));
    }
}

pub fn load_image(path: impl AsRef<Path>) -> Result<RgbaImage, EffectError> {
    Ok(image::open(path)?.to_rgba8())
}

/// Built-in source picture for when no image path is given: a hue ring on a
/// fully transparent background, so the alpha-skip path is exercised too.
pub fn placeholder_image(width: u32, height: u32) -> RgbaImage {
    let center = cgmath::vec2(width as f32 * 0.5, height as f32 * 0.5);
    let outer = width.min(height) as f32 * 0.4;
    let inner = width.min(height) as f32 * 0.14;

    RgbaImage::from_fn(width, height, |x, y| {
        let delta = cgmath::vec2(x as f32, y as f32) - center;
        let distance = delta.magnitude();
        if distance < inner || distance > outer {
            return image::Rgba([0, 0, 0, 0]);
        }
        let hue = delta.y.atan2(delta.x) / std::f32::consts::TAU + 0.5;
        let value = 1.0 - 0.5 * (distance - inner) / (outer - inner);
        let (r, g, b) = hue_rgb(hue);
        image::Rgba([
            (r * value * 255.0) as u8,
            (g * value * 255.0) as u8,
            (b * value * 255.0) as u8,
            255,
        ])
    })
}

fn hue_rgb(hue: f32) -> (f32, f32, f32) {
    let h = hue.fract() * 6.0;
    let x = 1.0 - ((h % 2.0) - 1.0).abs();
    match h as u32 {
        0 => (1.0, x, 0.0),
        1 => (x, 1.0, 0.0),
        2 => (0.0, 1.0, x),
        3 => (0.0, x, 1.0),
        4 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encase::StorageBuffer;

    fn opaque_image(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_pixel(width, height, image::Rgba([200, 100, 50, 255]))
    }

    fn sampled_field(image: &RgbaImage, gap: u32) -> Field {
        let mut field = Field::new(image.width(), image.height(), gap, DEFAULT_RADIUS).unwrap();
        field.init(image);
        field
    }

    fn white_particle(x: u32, y: u32, bounds: cgmath::Vector2<f32>) -> Particle {
        Particle::new(x, y, cgmath::vec3(1.0, 1.0, 1.0), bounds, &mut thread_rng())
    }

    fn origins(field: &Field) -> Vec<(f32, f32)> {
        field
            .particles
            .iter()
            .map(|p| (p.origin.x, p.origin.y))
            .collect()
    }

    #[test]
    fn init_samples_grid_at_stride() {
        let field = sampled_field(&opaque_image(10, 10), 5);
        assert_eq!(
            origins(&field),
            vec![(0.0, 0.0), (5.0, 0.0), (0.0, 5.0), (5.0, 5.0)]
        );
    }

    #[test]
    fn transparent_cell_produces_no_particle() {
        let mut image = opaque_image(10, 10);
        image.put_pixel(5, 0, image::Rgba([0, 0, 0, 0]));
        let field = sampled_field(&image, 5);
        assert_eq!(origins(&field), vec![(0.0, 0.0), (0.0, 5.0), (5.0, 5.0)]);
    }

    #[test]
    fn fully_transparent_image_yields_empty_field() {
        let image = RgbaImage::new(10, 10);
        let field = sampled_field(&image, 5);
        assert!(field.particles.is_empty());
    }

    #[test]
    fn smaller_image_is_sampled_centered() {
        let mut field = Field::new(20, 20, 5, DEFAULT_RADIUS).unwrap();
        field.init(&opaque_image(10, 10));
        // Opaque region covers 5..15 on both axes, so only strides 5 and 10 hit it.
        assert_eq!(
            origins(&field),
            vec![(5.0, 5.0), (10.0, 5.0), (5.0, 10.0), (10.0, 10.0)]
        );
    }

    #[test]
    fn sampled_color_comes_from_the_pixel() {
        let field = sampled_field(&opaque_image(10, 10), 5);
        let color = field.particles[0].color;
        assert!((color.x - 200.0 / 255.0).abs() < 1e-6);
        assert!((color.y - 100.0 / 255.0).abs() < 1e-6);
        assert!((color.z - 50.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn zero_gap_is_rejected() {
        assert!(matches!(
            Field::new(10, 10, 0, DEFAULT_RADIUS),
            Err(EffectError::ZeroGap)
        ));
    }

    #[test]
    fn warp_scatters_within_bounds_and_loosens_ease() {
        let mut field = sampled_field(&opaque_image(40, 30), 5);
        field.warp();
        for particle in &field.particles {
            assert!(particle.position.x >= 0.0 && particle.position.x < 40.0);
            assert!(particle.position.y >= 0.0 && particle.position.y < 30.0);
            assert_eq!(particle.ease, WARP_EASE);
        }
    }

    #[test]
    fn unset_pointer_decays_velocity_by_friction() {
        let mut particle = white_particle(0, 0, cgmath::vec2(10.0, 10.0));
        particle.velocity = cgmath::vec2(1.0, -2.0);
        particle.update(None, DEFAULT_RADIUS);
        assert!((particle.velocity.x - FRICTION).abs() < 1e-6);
        assert!((particle.velocity.y + 2.0 * FRICTION).abs() < 1e-6);
    }

    #[test]
    fn unset_pointer_converges_to_origin() {
        let mut particle = white_particle(3, 7, cgmath::vec2(10.0, 10.0));
        for _ in 0..500 {
            particle.update(None, DEFAULT_RADIUS);
        }
        assert!((particle.position - particle.origin).magnitude() < 1e-3);
    }

    #[test]
    fn origin_is_immutable_under_update_and_warp() {
        let mut particle = white_particle(3, 7, cgmath::vec2(10.0, 10.0));
        particle.update(Some(cgmath::vec2(4.0, 7.0)), DEFAULT_RADIUS);
        particle.warp(cgmath::vec2(10.0, 10.0), &mut thread_rng());
        assert_eq!(particle.origin, cgmath::vec2(3.0, 7.0));
    }

    #[test]
    fn near_pointer_applies_force_far_pointer_does_not() {
        let bounds = cgmath::vec2(2000.0, 2000.0);
        let mut near = white_particle(0, 0, bounds);
        near.position = cgmath::vec2(0.0, 0.0);
        let mut far = near;

        // dist_sq = 200 < 3000 on one side, 2_000_000 > 3000 on the other.
        near.update(Some(cgmath::vec2(10.0, 10.0)), DEFAULT_RADIUS);
        far.update(Some(cgmath::vec2(1000.0, 1000.0)), DEFAULT_RADIUS);

        assert!(near.velocity.magnitude() > 0.0);
        assert_eq!(far.velocity.magnitude(), 0.0);
    }

    #[test]
    fn pointer_exactly_on_particle_applies_no_force() {
        let mut particle = white_particle(0, 0, cgmath::vec2(10.0, 10.0));
        particle.position = cgmath::vec2(4.0, 4.0);
        particle.update(Some(cgmath::vec2(4.0, 4.0)), DEFAULT_RADIUS);
        assert!(particle.velocity.x.is_finite() && particle.velocity.y.is_finite());
        assert_eq!(particle.velocity.magnitude(), 0.0);
    }

    #[test]
    fn set_pointer_overwrites_previous_position() {
        let mut field = Field::new(10, 10, 5, DEFAULT_RADIUS).unwrap();
        assert!(field.pointer.is_none());
        field.set_pointer(1.0, 2.0);
        field.set_pointer(3.0, 4.0);
        assert_eq!(field.pointer, Some(cgmath::vec2(3.0, 4.0)));
    }

    #[test]
    fn particle_encoding_is_stable_without_update() {
        let field = sampled_field(&opaque_image(10, 10), 5);

        let encode = || {
            let mut buffer = StorageBuffer::new(Vec::<u8>::new());
            buffer.write(&field.particles).unwrap();
            buffer.into_inner()
        };
        assert_eq!(encode(), encode());
    }

    #[test]
    fn placeholder_image_has_transparent_corners_and_opaque_ring() {
        let image = placeholder_image(100, 100);
        assert_eq!(image.dimensions(), (100, 100));
        assert_eq!(image.get_pixel(0, 0).0[3], 0);
        assert_eq!(image.get_pixel(50, 50).0[3], 0);
        // Midway between the inner (14) and outer (40) ring radii.
        assert_eq!(image.get_pixel(77, 50).0[3], 255);
    }
}

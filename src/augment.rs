// augment.rs

use crate::config::{AugmentationConfig, AugmentationStrategy};
use crate::error::{Error, Result};
use image::{imageops, Rgb, RgbImage};
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometric_transformations::{warp, Interpolation, Projection};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::path::Path;
use std::sync::Arc;

/// RNG handed to random transforms; seeded per (epoch, sample) by the loader.
pub type AugRng = ChaCha8Rng;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Maps an RGB image of any size to a normalized CHW buffer of
/// `3 * size * size` floats.
pub trait ImageTransform: Send + Sync {
    fn apply(&self, img: RgbImage, rng: &mut AugRng) -> Vec<f32>;

    fn size(&self) -> u32;
}

/// Decodes any supported format and converts it to 8-bit RGB.
pub fn load_rgb(path: &Path) -> Result<RgbImage> {
    image::open(path)
        .map(|img| img.into_rgb8())
        .map_err(|source| Error::Decode {
            path: path.to_path_buf(),
            source,
        })
}

fn resize_square(img: RgbImage, size: u32) -> RgbImage {
    if img.width() == size && img.height() == size {
        img
    } else {
        imageops::resize(&img, size, size, imageops::FilterType::Triangle)
    }
}

/// HWC u8 -> CHW f32 with per-channel mean/std normalization.
pub fn normalize_chw(img: &RgbImage) -> Vec<f32> {
    let hw = (img.width() * img.height()) as usize;
    let pixels = img.as_raw();
    let mut chw = vec![0.0f32; 3 * hw];
    for i in 0..pixels.len() {
        let c = i % 3;
        let p = i / 3;
        chw[c * hw + p] = (pixels[i] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
    }
    chw
}

/// Inverse of [`normalize_chw`], clamped to u8.
pub fn denormalize_chw(chw: &[f32], size: u32) -> RgbImage {
    let hw = (size * size) as usize;
    RgbImage::from_fn(size, size, |x, y| {
        let p = (y * size + x) as usize;
        let mut px = [0u8; 3];
        for (c, v) in px.iter_mut().enumerate() {
            let f = chw[c * hw + p] * IMAGENET_STD[c] + IMAGENET_MEAN[c];
            *v = (f * 255.0).round().clamp(0.0, 255.0) as u8;
        }
        Rgb(px)
    })
}

/// Validation/test transform: resize and normalize, no randomness.
#[derive(Debug, Clone)]
pub struct EvalTransform {
    size: u32,
}

impl EvalTransform {
    pub fn new(size: u32) -> Self {
        Self { size }
    }

    pub fn transform(&self, img: RgbImage) -> Vec<f32> {
        normalize_chw(&resize_square(img, self.size))
    }
}

impl ImageTransform for EvalTransform {
    fn apply(&self, img: RgbImage, _rng: &mut AugRng) -> Vec<f32> {
        self.transform(img)
    }

    fn size(&self) -> u32 {
        self.size
    }
}

/// Resize, random horizontal flip, normalize.
#[derive(Debug, Clone)]
pub struct BasicAugment {
    size: u32,
    hflip_p: f64,
}

impl BasicAugment {
    pub fn new(size: u32, hflip_p: f64) -> Self {
        Self { size, hflip_p }
    }
}

impl ImageTransform for BasicAugment {
    fn apply(&self, img: RgbImage, rng: &mut AugRng) -> Vec<f32> {
        let mut img = resize_square(img, self.size);
        if rng.gen_bool(self.hflip_p) {
            imageops::flip_horizontal_in_place(&mut img);
        }
        normalize_chw(&img)
    }

    fn size(&self) -> u32 {
        self.size
    }
}

/// Full training pipeline: every perturbation is drawn independently with
/// its own probability.
#[derive(Debug, Clone)]
pub struct ExtendedAugment {
    size: u32,
    cfg: AugmentationConfig,
}

impl ExtendedAugment {
    pub fn new(size: u32, cfg: AugmentationConfig) -> Self {
        Self { size, cfg }
    }
}

fn symmetric(rng: &mut AugRng, limit: f64) -> f64 {
    if limit > 0.0 {
        rng.gen_range(-limit..=limit)
    } else {
        0.0
    }
}

fn rotate90(img: RgbImage, quarter_turns: u32) -> RgbImage {
    match quarter_turns % 4 {
        1 => imageops::rotate90(&img),
        2 => imageops::rotate180(&img),
        3 => imageops::rotate270(&img),
        _ => img,
    }
}

/// Affine warp about the image center; exposed pixels are black.
fn shift_scale_rotate(img: &RgbImage, dx: f32, dy: f32, scale: f32, degrees: f32) -> RgbImage {
    let cx = img.width() as f32 / 2.0;
    let cy = img.height() as f32 / 2.0;
    let projection = Projection::translate(-cx, -cy)
        .and_then(Projection::scale(scale, scale))
        .and_then(Projection::rotate(degrees.to_radians()))
        .and_then(Projection::translate(cx + dx, cy + dy));
    warp(img, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]))
}

/// Mixes each pixel with its luma; `factor` 0 gives grayscale, 1 leaves the
/// image unchanged.
fn saturate(img: &mut RgbImage, factor: f32) {
    for p in img.pixels_mut() {
        let [r, g, b] = p.0.map(f32::from);
        let gray = 0.299 * r + 0.587 * g + 0.114 * b;
        *p = Rgb(p
            .0
            .map(|v| ((f32::from(v) - gray) * factor + gray).round().clamp(0.0, 255.0) as u8));
    }
}

/// Brightness, contrast and saturation factors near 1, hue offset as a
/// fraction of the color circle.
fn color_jitter(img: &RgbImage, brightness: f32, contrast: f32, saturation: f32, hue: f32) -> RgbImage {
    // image's brighten is additive and contrast takes a percentage
    let mut out = imageops::brighten(img, ((brightness - 1.0) * 255.0).round() as i32);
    if contrast != 1.0 {
        out = imageops::contrast(&out, (contrast - 1.0) * 100.0);
    }
    if saturation != 1.0 {
        saturate(&mut out, saturation);
    }
    let degrees = (hue * 360.0).round() as i32;
    if degrees != 0 {
        out = imageops::huerotate(&out, degrees);
    }
    out
}

impl ImageTransform for ExtendedAugment {
    fn apply(&self, img: RgbImage, rng: &mut AugRng) -> Vec<f32> {
        let cfg = &self.cfg;
        let mut img = resize_square(img, self.size);

        if rng.gen_bool(cfg.rotate90_p) {
            img = rotate90(img, rng.gen_range(0..4));
        }
        if rng.gen_bool(cfg.shift_scale_rotate_p) {
            let side = self.size as f64;
            let dx = symmetric(rng, cfg.shift_limit) * side;
            let dy = symmetric(rng, cfg.shift_limit) * side;
            let scale = 1.0 + symmetric(rng, cfg.scale_limit);
            let degrees = symmetric(rng, cfg.rotate_limit);
            img = shift_scale_rotate(&img, dx as f32, dy as f32, scale as f32, degrees as f32);
        }
        if rng.gen_bool(cfg.hflip_p) {
            imageops::flip_horizontal_in_place(&mut img);
        }
        if rng.gen_bool(cfg.vflip_p) {
            imageops::flip_vertical_in_place(&mut img);
        }
        if rng.gen_bool(cfg.color_jitter_p) {
            let b = 1.0 + symmetric(rng, cfg.brightness);
            let c = 1.0 + symmetric(rng, cfg.contrast);
            let s = 1.0 + symmetric(rng, cfg.saturation);
            let h = symmetric(rng, cfg.hue);
            img = color_jitter(
                &img,
                b.max(0.0) as f32,
                c.max(0.0) as f32,
                s.max(0.0) as f32,
                h as f32,
            );
        }
        if rng.gen_bool(cfg.blur_p) {
            let (lo, hi) = cfg.blur_sigma;
            let sigma = if hi > lo { rng.gen_range(lo..=hi) } else { lo };
            img = gaussian_blur_f32(&img, sigma.max(f32::EPSILON));
        }

        normalize_chw(&img)
    }

    fn size(&self) -> u32 {
        self.size
    }
}

/// Training transform selected by `cfg.strategy`.
pub fn train_transform(size: u32, cfg: &AugmentationConfig) -> Arc<dyn ImageTransform> {
    match cfg.strategy {
        AugmentationStrategy::Basic => Arc::new(BasicAugment::new(size, cfg.hflip_p)),
        AugmentationStrategy::Extended => Arc::new(ExtendedAugment::new(size, cfg.clone())),
    }
}

pub fn eval_transform(size: u32) -> Arc<dyn ImageTransform> {
    Arc::new(EvalTransform::new(size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, 128]))
    }

    #[test]
    fn outputs_have_fixed_shape() {
        let mut rng = AugRng::seed_from_u64(0);
        let cfg = AugmentationConfig::default();
        let transforms: Vec<Arc<dyn ImageTransform>> = vec![
            eval_transform(32),
            train_transform(32, &cfg),
            train_transform(
                32,
                &AugmentationConfig {
                    strategy: AugmentationStrategy::Basic,
                    ..cfg.clone()
                },
            ),
        ];
        for t in transforms {
            for (w, h) in [(17, 63), (32, 32), (200, 90)] {
                let out = t.apply(gradient(w, h), &mut rng);
                assert_eq!(out.len(), 3 * 32 * 32);
                assert!(out.iter().all(|v| v.is_finite()));
            }
        }
    }

    #[test]
    fn eval_transform_is_deterministic_and_idempotent() {
        let t = EvalTransform::new(24);
        let img = gradient(50, 40);
        let a = t.transform(img.clone());
        let b = t.transform(img);
        assert_eq!(a, b);

        // an image already at the target size only gets normalized
        let resized = denormalize_chw(&a, 24);
        let again = t.transform(resized.clone());
        assert_eq!(again, normalize_chw(&resized));
        for (x, y) in a.iter().zip(&again) {
            assert!((x - y).abs() < 0.02);
        }
    }

    #[test]
    fn normalization_uses_channel_constants() {
        let img = RgbImage::from_pixel(2, 2, Rgb([255, 0, 0]));
        let chw = normalize_chw(&img);
        assert!((chw[0] - (1.0 - 0.485) / 0.229).abs() < 1e-6);
        assert!((chw[4] - (-0.456 / 0.224)).abs() < 1e-6);
        assert!((chw[8] - (-0.406 / 0.225)).abs() < 1e-6);
    }

    #[test]
    fn same_seed_same_augmentation() {
        let t = ExtendedAugment::new(32, AugmentationConfig::default());
        let a = t.apply(gradient(64, 48), &mut AugRng::seed_from_u64(9));
        let b = t.apply(gradient(64, 48), &mut AugRng::seed_from_u64(9));
        assert_eq!(a, b);
    }

    #[test]
    fn neutral_jitter_keeps_pixels() {
        let orig = gradient(8, 8);
        let img = color_jitter(&orig, 1.0, 1.0, 1.0, 0.0);
        for (a, b) in img.pixels().zip(orig.pixels()) {
            for ch in 0..3 {
                assert!((a[ch] as i32 - b[ch] as i32).abs() <= 1);
            }
        }
    }

    #[test]
    fn jitter_factors_move_pixels() {
        let gray = RgbImage::from_pixel(4, 4, Rgb([100, 100, 100]));
        let brighter = color_jitter(&gray, 1.2, 1.0, 1.0, 0.0);
        assert!(brighter.pixels().all(|p| p[0] > 100));

        let red = RgbImage::from_pixel(4, 4, Rgb([200, 40, 40]));
        let desaturated = color_jitter(&red, 1.0, 1.0, 0.0, 0.0);
        let p = desaturated.get_pixel(0, 0);
        assert_eq!(p[0], p[1]);
        assert_eq!(p[1], p[2]);

        let shifted = color_jitter(&red, 1.0, 1.0, 1.0, 0.3);
        assert_ne!(shifted.get_pixel(0, 0), red.get_pixel(0, 0));
    }
}

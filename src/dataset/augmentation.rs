//! Random affine augmentation for training images.
//!
//! Mirrors the classic `ImageDataGenerator` policy used for fundus photos:
//! a small rotation, a horizontal/vertical shift expressed as a fraction of
//! the image size, an independent zoom per axis, and a horizontal flip.
//! The geometric part is a single inverse affine warp about the image
//! centre, sampled bilinearly; coordinates that fall outside the source
//! are resolved by the [`FillMode`].
//!
//! Validation images are never augmented.

use image::{imageops, Rgb, RgbImage};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::utils::error::{EyeConditionError, Result};

/// How samples outside the source image are filled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillMode {
    /// Repeat the closest edge pixel (`aaaa|abcd|dddd`)
    #[default]
    Nearest,
    /// Mirror about the edge (`dcba|abcd|dcba`)
    Reflect,
    /// Tile the image (`abcd|abcd|abcd`)
    Wrap,
    /// Black
    Constant,
}

impl FillMode {
    /// Map a possibly out-of-range pixel index into `0..len`, or `None` for constant fill
    fn resolve(self, index: i64, len: u32) -> Option<u32> {
        let n = len as i64;
        if (0..n).contains(&index) {
            return Some(index as u32);
        }
        match self {
            FillMode::Nearest => Some(index.clamp(0, n - 1) as u32),
            FillMode::Reflect => {
                let m = index.rem_euclid(2 * n);
                Some(if m < n { m } else { 2 * n - 1 - m } as u32)
            }
            FillMode::Wrap => Some(index.rem_euclid(n) as u32),
            FillMode::Constant => None,
        }
    }
}

/// Augmentation ranges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    /// Maximum rotation in degrees, sampled from `[-r, r]`
    pub rotation_range: f32,
    /// Maximum horizontal shift as a fraction of the width
    pub width_shift_range: f32,
    /// Maximum vertical shift as a fraction of the height
    pub height_shift_range: f32,
    /// Zoom factors are sampled from `[1 - z, 1 + z]` for each axis
    pub zoom_range: f32,
    pub horizontal_flip: bool,
    pub fill_mode: FillMode,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            rotation_range: 10.0,
            width_shift_range: 0.05,
            height_shift_range: 0.05,
            zoom_range: 0.1,
            horizontal_flip: true,
            fill_mode: FillMode::Nearest,
        }
    }
}

impl AugmentationConfig {
    /// A configuration that leaves every image untouched
    pub fn none() -> Self {
        Self {
            rotation_range: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            zoom_range: 0.0,
            horizontal_flip: false,
            fill_mode: FillMode::Nearest,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let ranges = [
            ("rotation_range", self.rotation_range, f32::INFINITY),
            ("width_shift_range", self.width_shift_range, 1.0),
            ("height_shift_range", self.height_shift_range, 1.0),
            ("zoom_range", self.zoom_range, 1.0),
        ];
        for (name, value, upper) in ranges {
            if !(value >= 0.0 && value < upper) {
                return Err(EyeConditionError::Config(format!(
                    "augmentation.{} must be in [0, {}), got {}",
                    name, upper, value
                )));
            }
        }
        Ok(())
    }
}

/// One sampled set of transform parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineParams {
    pub rotation_degrees: f32,
    /// Horizontal shift in pixels
    pub shift_x: f32,
    /// Vertical shift in pixels
    pub shift_y: f32,
    pub zoom_x: f32,
    pub zoom_y: f32,
    pub flip: bool,
}

impl AffineParams {
    pub fn identity() -> Self {
        Self {
            rotation_degrees: 0.0,
            shift_x: 0.0,
            shift_y: 0.0,
            zoom_x: 1.0,
            zoom_y: 1.0,
            flip: false,
        }
    }

    fn is_identity_warp(&self) -> bool {
        self.rotation_degrees == 0.0
            && self.shift_x == 0.0
            && self.shift_y == 0.0
            && self.zoom_x == 1.0
            && self.zoom_y == 1.0
    }
}

/// Applies random affine transforms drawn from an [`AugmentationConfig`]
#[derive(Debug, Clone)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    /// Draw transform parameters for an image of the given size
    pub fn sample_params<R: Rng>(&self, width: u32, height: u32, rng: &mut R) -> AffineParams {
        let c = &self.config;
        let rotation_degrees = symmetric(rng, c.rotation_range);
        let shift_x = symmetric(rng, c.width_shift_range) * width as f32;
        let shift_y = symmetric(rng, c.height_shift_range) * height as f32;
        let (zoom_x, zoom_y) = if c.zoom_range > 0.0 {
            (
                rng.gen_range(1.0 - c.zoom_range..=1.0 + c.zoom_range),
                rng.gen_range(1.0 - c.zoom_range..=1.0 + c.zoom_range),
            )
        } else {
            (1.0, 1.0)
        };
        let flip = c.horizontal_flip && rng.gen_bool(0.5);

        AffineParams {
            rotation_degrees,
            shift_x,
            shift_y,
            zoom_x,
            zoom_y,
            flip,
        }
    }

    /// Augment an image with freshly sampled parameters
    pub fn augment<R: Rng>(&self, img: &RgbImage, rng: &mut R) -> RgbImage {
        let params = self.sample_params(img.width(), img.height(), rng);
        self.apply(img, &params)
    }

    /// Apply a fixed set of parameters
    pub fn apply(&self, img: &RgbImage, params: &AffineParams) -> RgbImage {
        let mut out = if params.is_identity_warp() {
            img.clone()
        } else {
            self.warp(img, params)
        };
        if params.flip {
            imageops::flip_horizontal_in_place(&mut out);
        }
        out
    }

    /// Inverse-map every output pixel into the source:
    /// `src = R(θ) · Z · (dst - c) + c + t`
    fn warp(&self, img: &RgbImage, params: &AffineParams) -> RgbImage {
        let (width, height) = img.dimensions();
        let cx = (width as f32 - 1.0) / 2.0;
        let cy = (height as f32 - 1.0) / 2.0;
        let theta = params.rotation_degrees.to_radians();
        let (sin, cos) = theta.sin_cos();

        RgbImage::from_fn(width, height, |x, y| {
            let dx = (x as f32 - cx) * params.zoom_x;
            let dy = (y as f32 - cy) * params.zoom_y;
            let src_x = cos * dx - sin * dy + cx + params.shift_x;
            let src_y = sin * dx + cos * dy + cy + params.shift_y;
            bilinear_sample(img, src_x, src_y, self.config.fill_mode)
        })
    }
}

fn symmetric<R: Rng>(rng: &mut R, range: f32) -> f32 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

fn bilinear_sample(img: &RgbImage, x: f32, y: f32, fill: FillMode) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let fetch = |ix: i64, iy: i64| -> [f32; 3] {
        match (fill.resolve(ix, width), fill.resolve(iy, height)) {
            (Some(px), Some(py)) => {
                let p = img.get_pixel(px, py);
                [p[0] as f32, p[1] as f32, p[2] as f32]
            }
            _ => [0.0; 3],
        }
    };

    let p00 = fetch(x0, y0);
    let p10 = fetch(x0 + 1, y0);
    let p01 = fetch(x0, y0 + 1);
    let p11 = fetch(x0 + 1, y0 + 1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let v = p00[c] * (1.0 - fx) * (1.0 - fy)
            + p10[c] * fx * (1.0 - fy)
            + p01[c] * (1.0 - fx) * fy
            + p11[c] * fx * fy;
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Derive the RNG seed for one training item in one epoch
pub fn item_seed(seed: u64, epoch: usize, index: usize) -> u64 {
    let mut z = seed
        ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (index as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    // splitmix64 finaliser
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

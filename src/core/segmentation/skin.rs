//! HSV skin-tone classification.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::frame::{Frame, BYTES_PER_PIXEL};

/// HSV color value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hsv {
    pub h: f32, // 0-360
    pub s: f32, // 0-255
    pub v: f32, // 0-255
}

impl Hsv {
    pub fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        let r = r as f32 / 255.0;
        let g = g as f32 / 255.0;
        let b = b as f32 / 255.0;

        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let delta = max - min;

        let h = if delta == 0.0 {
            0.0
        } else if max == r {
            60.0 * (((g - b) / delta) % 6.0)
        } else if max == g {
            60.0 * (((b - r) / delta) + 2.0)
        } else {
            60.0 * (((r - g) / delta) + 4.0)
        };
        let h = if h < 0.0 { h + 360.0 } else { h };

        let s = if max == 0.0 { 0.0 } else { delta / max };

        Hsv {
            h,
            s: s * 255.0,
            v: max * 255.0,
        }
    }
}

/// Inclusive HSV ranges accepted as skin. Saturation and value use a 0-255 scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkinThresholds {
    pub hue_min: f32,
    pub hue_max: f32,
    pub sat_min: f32,
    pub sat_max: f32,
    pub val_min: f32,
    pub val_max: f32,
}

impl Default for SkinThresholds {
    fn default() -> Self {
        Self {
            hue_min: 0.0,
            hue_max: 25.0,
            sat_min: 40.0,
            sat_max: 255.0,
            val_min: 60.0,
            val_max: 255.0,
        }
    }
}

impl SkinThresholds {
    pub fn contains(&self, hsv: Hsv) -> bool {
        hsv.h >= self.hue_min
            && hsv.h <= self.hue_max
            && hsv.s >= self.sat_min
            && hsv.s <= self.sat_max
            && hsv.v >= self.val_min
            && hsv.v <= self.val_max
    }
}

/// Per-pixel skin classification, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct SkinMask {
    width: u32,
    height: u32,
    data: Vec<bool>,
}

impl SkinMask {
    pub fn new(width: u32, height: u32, data: Vec<bool>) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize);
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.data
    }

    pub fn is_skin(&self, x: u32, y: u32) -> bool {
        self.data[y as usize * self.width as usize + x as usize]
    }

    pub fn skin_pixel_count(&self) -> usize {
        self.data.iter().filter(|&&skin| skin).count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SkinMaskClassifier {
    thresholds: SkinThresholds,
}

impl SkinMaskClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thresholds(thresholds: SkinThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &SkinThresholds {
        &self.thresholds
    }

    pub fn is_skin(&self, r: u8, g: u8, b: u8) -> bool {
        self.thresholds.contains(Hsv::from_rgb(r, g, b))
    }

    /// Classifies every pixel of `frame`. The frame must be valid (see [`Frame::validate`]).
    pub fn classify(&self, frame: &Frame) -> SkinMask {
        let width = frame.width as usize;
        let mut data = vec![false; frame.pixel_count()];

        data.par_chunks_mut(width)
            .zip(frame.data.par_chunks(width * BYTES_PER_PIXEL))
            .for_each(|(mask_row, pixel_row)| {
                for (skin, rgba) in mask_row
                    .iter_mut()
                    .zip(pixel_row.chunks_exact(BYTES_PER_PIXEL))
                {
                    *skin = self.is_skin(rgba[0], rgba[1], rgba[2]);
                }
            });

        SkinMask::new(frame.width, frame.height, data)
    }
}

//! Named test-time augmentations
//!
//! Every policy is a composition of a vertical flip, a horizontal flip and a
//! transpose, applied in that order to each channel plane.

use std::fmt;
use std::str::FromStr;

use image::{imageops, GrayImage};

use crate::error::EmbeddingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Augmentation {
    Default,
    FlipUd,
    FlipLr,
    Transpose,
    FlipUdLr,
    FlipUdTranspose,
    FlipLrTranspose,
    FlipUdLrTranspose,
}

impl Augmentation {
    pub const ALL: [Augmentation; 8] = [
        Augmentation::Default,
        Augmentation::FlipUd,
        Augmentation::FlipLr,
        Augmentation::Transpose,
        Augmentation::FlipUdLr,
        Augmentation::FlipUdTranspose,
        Augmentation::FlipLrTranspose,
        Augmentation::FlipUdLrTranspose,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Augmentation::Default => "default",
            Augmentation::FlipUd => "flipud",
            Augmentation::FlipLr => "fliplr",
            Augmentation::Transpose => "transpose",
            Augmentation::FlipUdLr => "flipud_lr",
            Augmentation::FlipUdTranspose => "flipud_transpose",
            Augmentation::FlipLrTranspose => "fliplr_transpose",
            Augmentation::FlipUdLrTranspose => "flipud_lr_transpose",
        }
    }

    /// (flip vertical, flip horizontal, transpose)
    fn steps(&self) -> (bool, bool, bool) {
        match self {
            Augmentation::Default => (false, false, false),
            Augmentation::FlipUd => (true, false, false),
            Augmentation::FlipLr => (false, true, false),
            Augmentation::Transpose => (false, false, true),
            Augmentation::FlipUdLr => (true, true, false),
            Augmentation::FlipUdTranspose => (true, false, true),
            Augmentation::FlipLrTranspose => (false, true, true),
            Augmentation::FlipUdLrTranspose => (true, true, true),
        }
    }

    pub fn apply(&self, plane: GrayImage) -> GrayImage {
        let (flip_ud, flip_lr, transpose) = self.steps();
        let mut plane = plane;
        if flip_ud {
            imageops::flip_vertical_in_place(&mut plane);
        }
        if flip_lr {
            imageops::flip_horizontal_in_place(&mut plane);
        }
        if transpose {
            // rotate90 maps (x, y) to (h - 1 - y, x); mirroring that gives (y, x)
            plane = imageops::flip_horizontal(&imageops::rotate90(&plane));
        }
        plane
    }
}

impl FromStr for Augmentation {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Augmentation::ALL
            .iter()
            .copied()
            .find(|a| a.name() == s)
            .ok_or_else(|| {
                EmbeddingError::configuration(format!("Unknown augmentation '{}'", s))
            })
    }
}

impl fmt::Display for Augmentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

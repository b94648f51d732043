//! Multi-resolution image pyramids.

use crate::field::Field;
use crate::{FlowError, Result};

/// Number of pyramid levels; level 0 is full resolution, level 4 is coarsest.
pub const PYRAMID_LEVELS: usize = 5;

/// Spatial resolution must divide by this for the coarsest level to be exact.
const RESOLUTION_MULTIPLE: usize = 1 << (PYRAMID_LEVELS - 1);

/// Five-level area-averaged pyramid built once per image, read-only after.
#[derive(Debug, Clone)]
pub struct ImagePyramid {
    levels: Vec<Field>,
}

impl ImagePyramid {
    /// Builds the pyramid `[image, /2, /4, /8, /16]`. Every level is computed
    /// from the full-resolution image with area averaging, not by repeated
    /// halving, so a level never inherits the rounding of the level above it.
    pub fn build(image: &Field) -> Result<Self> {
        let (height, width, _) = image.shape();
        if height % RESOLUTION_MULTIPLE != 0 || width % RESOLUTION_MULTIPLE != 0 {
            return Err(FlowError::Shape(format!(
                "image resolution {height}x{width} must be divisible by {RESOLUTION_MULTIPLE}"
            )));
        }
        let mut levels = Vec::with_capacity(PYRAMID_LEVELS);
        levels.push(image.clone());
        for k in 1..PYRAMID_LEVELS {
            levels.push(image.downsample_area(1 << k)?);
        }
        Ok(Self { levels })
    }

    /// The image at pyramid level `k` (0 = full resolution).
    pub fn level(&self, k: usize) -> &Field {
        &self.levels[k]
    }

    pub fn levels(&self) -> &[Field] {
        &self.levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_level_halves_the_previous() {
        let image = Field::filled(32, 48, 3, 0.5);
        let pyramid = ImagePyramid::build(&image).unwrap();
        assert_eq!(pyramid.levels().len(), PYRAMID_LEVELS);
        for k in 0..PYRAMID_LEVELS - 1 {
            let (h, w, c) = pyramid.level(k).shape();
            let (h2, w2, c2) = pyramid.level(k + 1).shape();
            assert_eq!((h2, w2), (h / 2, w / 2));
            assert_eq!(c, c2);
        }
    }

    #[test]
    fn rejects_resolutions_not_divisible_by_16() {
        let image = Field::filled(30, 32, 3, 0.5);
        assert!(matches!(
            ImagePyramid::build(&image),
            Err(FlowError::Shape(_))
        ));
    }

    #[test]
    fn constant_images_stay_constant_across_levels() {
        let image = Field::filled(16, 16, 3, 0.25);
        let pyramid = ImagePyramid::build(&image).unwrap();
        for level in pyramid.levels() {
            assert!(level.data().iter().all(|v| (v - 0.25).abs() < 1e-6));
        }
    }
}

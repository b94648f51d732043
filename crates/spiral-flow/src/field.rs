//! Dense `f32` fields shared by every stage of the pipeline.
//!
//! A [`Field`] is a row-major `[height, width, channels]` tensor. Images use
//! three channels in `[0, 1]`, flow fields two channels (horizontal then
//! vertical displacement), masks a single channel in `[0, 1]`.

use crate::{FlowError, Result};

/// Dense HWC tensor backing images, flow fields and masks.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    height: usize,
    width: usize,
    channels: usize,
    data: Vec<f32>,
}

impl Field {
    /// Builds a field from raw data, validating the element count.
    pub fn new(height: usize, width: usize, channels: usize, data: Vec<f32>) -> Result<Self> {
        if height == 0 || width == 0 || channels == 0 {
            return Err(FlowError::InvalidArgument(format!(
                "field dimensions must be > 0, got {height}x{width}x{channels}"
            )));
        }
        let expected = height * width * channels;
        if data.len() != expected {
            return Err(FlowError::Shape(format!(
                "data length mismatch: expected {expected}, got {}",
                data.len()
            )));
        }
        Ok(Self {
            height,
            width,
            channels,
            data,
        })
    }

    /// Field filled with a constant value.
    pub fn filled(height: usize, width: usize, channels: usize, value: f32) -> Self {
        Self {
            height,
            width,
            channels,
            data: vec![value; height * width * channels],
        }
    }

    pub fn zeros(height: usize, width: usize, channels: usize) -> Self {
        Self::filled(height, width, channels, 0.0)
    }

    pub fn ones(height: usize, width: usize, channels: usize) -> Self {
        Self::filled(height, width, channels, 1.0)
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        (self.height, self.width, self.channels)
    }

    /// Total element count, the denominator used by every mean reduction.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[inline]
    pub fn index(&self, y: usize, x: usize, c: usize) -> usize {
        (y * self.width + x) * self.channels + c
    }

    #[inline]
    pub fn at(&self, y: usize, x: usize, c: usize) -> f32 {
        self.data[self.index(y, x, c)]
    }

    #[inline]
    pub fn set(&mut self, y: usize, x: usize, c: usize, value: f32) {
        let idx = self.index(y, x, c);
        self.data[idx] = value;
    }

    pub fn same_shape(&self, other: &Field) -> bool {
        self.shape() == other.shape()
    }

    /// Elementwise sum, used by the residual flow composition.
    pub fn add(&self, other: &Field) -> Result<Field> {
        if !self.same_shape(other) {
            return Err(FlowError::Shape(format!(
                "cannot add fields of shape {:?} and {:?}",
                self.shape(),
                other.shape()
            )));
        }
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a + b)
            .collect();
        Self::new(self.height, self.width, self.channels, data)
    }

    /// Returns a copy with every element multiplied by `factor`.
    pub fn scaled(&self, factor: f32) -> Field {
        let data = self.data.iter().map(|v| v * factor).collect();
        Self {
            height: self.height,
            width: self.width,
            channels: self.channels,
            data,
        }
    }

    /// Clamps every element into `[lo, hi]` in place.
    pub fn clamp_in_place(&mut self, lo: f32, hi: f32) {
        for value in &mut self.data {
            *value = value.clamp(lo, hi);
        }
    }

    /// Area-averaging downsample by an integer factor. Every source pixel in
    /// an aligned `factor`x`factor` block contributes equally, which keeps the
    /// pyramid alias-free before the predictor sees it.
    pub fn downsample_area(&self, factor: usize) -> Result<Field> {
        if factor == 0 {
            return Err(FlowError::InvalidArgument(
                "downsample factor must be > 0".to_string(),
            ));
        }
        if self.height % factor != 0 || self.width % factor != 0 {
            return Err(FlowError::Shape(format!(
                "resolution {}x{} is not divisible by {factor}",
                self.height, self.width
            )));
        }
        let out_h = self.height / factor;
        let out_w = self.width / factor;
        let norm = 1.0 / (factor * factor) as f32;
        let mut out = Field::zeros(out_h, out_w, self.channels);
        for y in 0..out_h {
            for x in 0..out_w {
                for c in 0..self.channels {
                    let mut acc = 0.0f32;
                    for dy in 0..factor {
                        for dx in 0..factor {
                            acc += self.at(y * factor + dy, x * factor + dx, c);
                        }
                    }
                    out.set(y, x, c, acc * norm);
                }
            }
        }
        Ok(out)
    }

    /// Bilinear resize to an arbitrary resolution. Source coordinates follow
    /// the legacy `dst * (in / out)` mapping so that constant fields resize
    /// exactly and flow guesses upsample without drift.
    pub fn resize_bilinear(&self, out_h: usize, out_w: usize) -> Result<Field> {
        if out_h == 0 || out_w == 0 {
            return Err(FlowError::InvalidArgument(
                "resize target must be > 0".to_string(),
            ));
        }
        let scale_y = self.height as f32 / out_h as f32;
        let scale_x = self.width as f32 / out_w as f32;
        let mut out = Field::zeros(out_h, out_w, self.channels);
        for y in 0..out_h {
            let sy = y as f32 * scale_y;
            for x in 0..out_w {
                let sx = x as f32 * scale_x;
                for c in 0..self.channels {
                    out.set(y, x, c, self.sample_bilinear(sy, sx, c));
                }
            }
        }
        Ok(out)
    }

    /// Bilinear lookup at a continuous coordinate, clamped to the frame.
    #[inline]
    pub fn sample_bilinear(&self, y: f32, x: f32, c: usize) -> f32 {
        let max_y = (self.height - 1) as f32;
        let max_x = (self.width - 1) as f32;
        let y = y.clamp(0.0, max_y);
        let x = x.clamp(0.0, max_x);
        let y0 = y.floor() as usize;
        let x0 = x.floor() as usize;
        let y1 = (y0 + 1).min(self.height - 1);
        let x1 = (x0 + 1).min(self.width - 1);
        let fy = y - y0 as f32;
        let fx = x - x0 as f32;
        let top = self.at(y0, x0, c) * (1.0 - fx) + self.at(y0, x1, c) * fx;
        let bottom = self.at(y1, x0, c) * (1.0 - fx) + self.at(y1, x1, c) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// Horizontal first difference, shape `[h, w-1, c]`.
    pub fn diff_x(&self) -> Result<Field> {
        if self.width < 2 {
            return Err(FlowError::Shape(
                "horizontal difference needs width >= 2".to_string(),
            ));
        }
        let mut out = Field::zeros(self.height, self.width - 1, self.channels);
        for y in 0..self.height {
            for x in 0..self.width - 1 {
                for c in 0..self.channels {
                    out.set(y, x, c, self.at(y, x + 1, c) - self.at(y, x, c));
                }
            }
        }
        Ok(out)
    }

    /// Vertical first difference, shape `[h-1, w, c]`.
    pub fn diff_y(&self) -> Result<Field> {
        if self.height < 2 {
            return Err(FlowError::Shape(
                "vertical difference needs height >= 2".to_string(),
            ));
        }
        let mut out = Field::zeros(self.height - 1, self.width, self.channels);
        for y in 0..self.height - 1 {
            for x in 0..self.width {
                for c in 0..self.channels {
                    out.set(y, x, c, self.at(y + 1, x, c) - self.at(y, x, c));
                }
            }
        }
        Ok(out)
    }

    /// Copy without the first row, used to align masks with vertical diffs.
    pub fn drop_first_row(&self) -> Result<Field> {
        if self.height < 2 {
            return Err(FlowError::Shape(
                "cannot drop a row from a single-row field".to_string(),
            ));
        }
        let start = self.width * self.channels;
        Field::new(
            self.height - 1,
            self.width,
            self.channels,
            self.data[start..].to_vec(),
        )
    }

    /// Copy without the first column, used to align masks with horizontal diffs.
    pub fn drop_first_col(&self) -> Result<Field> {
        if self.width < 2 {
            return Err(FlowError::Shape(
                "cannot drop a column from a single-column field".to_string(),
            ));
        }
        let mut out = Field::zeros(self.height, self.width - 1, self.channels);
        for y in 0..self.height {
            for x in 1..self.width {
                for c in 0..self.channels {
                    out.set(y, x - 1, c, self.at(y, x, c));
                }
            }
        }
        Ok(out)
    }
}

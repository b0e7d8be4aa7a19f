use fast_image_resize::images::Image;
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use image::{DynamicImage, RgbImage};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub height: usize,
    pub width: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
            height: 224,
            width: 224,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Processor {
    pub config: PreprocessConfig,
}

impl Processor {
    /// Create a new instance of the Processor struct
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Converts to RGB8 and resizes to the configured size with a bilinear filter.
    pub fn resize(&self, image: &DynamicImage) -> Result<RgbImage> {
        let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
        let (width, height) = (self.config.width as u32, self.config.height as u32);
        if rgb.width() == width && rgb.height() == height {
            return Ok(rgb.into_rgb8());
        }

        let mut dst_image = Image::new(width, height, PixelType::U8x3);
        let mut resizer = Resizer::new();
        let options = ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear));
        resizer.resize(&rgb, &mut dst_image, Some(&options))?;

        RgbImage::from_raw(width, height, dst_image.buffer().to_vec())
            .ok_or_else(|| Error::Signature("resized buffer does not match target size".into()))
    }

    /// Produces a normalized `[1, 3, H, W]` NCHW tensor.
    pub fn preprocess(&self, image: &DynamicImage) -> Result<Array4<f32>> {
        let resized = self.resize(image)?;
        let PreprocessConfig { mean, std, height, width } = self.config;

        let mut img_arr = Array4::<f32>::zeros((1, 3, height, width));
        for (x, y, rgb) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                img_arr[[0, c, y, x]] = (rgb[c] as f32 / 255.0 - mean[c]) / std[c];
            }
        }
        Ok(img_arr)
    }
}

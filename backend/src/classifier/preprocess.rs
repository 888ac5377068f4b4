use image::DynamicImage;
use image::imageops::{self, FilterType};
use ndarray::Array3;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Normalized network input laid out as `[channel, row, column]`.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    pub data: Array3<f32>,
}

impl InputTensor {
    pub fn zeros(size: u32) -> Self {
        let side = size as usize;
        Self {
            data: Array3::zeros((3, side, side)),
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        let (c, h, w) = self.data.dim();
        [c, h, w]
    }

    #[cfg(feature = "torch")]
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }
}

/// Resize to `size`×`size`, force RGB, scale to [0, 1], then apply the
/// ImageNet per-channel mean/std normalization.
pub fn preprocess(image: &DynamicImage, size: u32) -> InputTensor {
    let rgb = image.to_rgb8();
    let resized = imageops::resize(&rgb, size, size, FilterType::Triangle);
    let side = size as usize;
    let data = Array3::from_shape_fn((3, side, side), |(c, y, x)| {
        let value = f32::from(resized.get_pixel(x as u32, y as u32)[c]) / 255.0;
        (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c]
    });
    InputTensor { data }
}

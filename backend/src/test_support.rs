use image::{DynamicImage, ImageFormat, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Cursor;

use crate::classifier::preprocess::InputTensor;
use crate::classifier::{EngineError, InferenceEngine};

/// Random pixels so encoded fixtures do not compress below the byte floor.
pub fn noise_image(width: u32, height: u32) -> DynamicImage {
    let mut rng = StdRng::seed_from_u64(u64::from(width) << 32 | u64::from(height));
    let img = RgbImage::from_fn(width, height, |_, _| {
        image::Rgb([rng.random(), rng.random(), rng.random()])
    });
    DynamicImage::ImageRgb8(img)
}

pub fn encode(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), format)
        .unwrap();
    bytes
}

/// A filled canvas with a centered ellipse, declared at `width`x`height`.
pub fn svg_fixture(width: u32, height: u32) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{width}\" height=\"{height}\">\
         <rect width=\"{width}\" height=\"{height}\" fill=\"#2a6f97\"/>\
         <ellipse cx=\"{cx}\" cy=\"{cy}\" rx=\"{rx}\" ry=\"{ry}\" fill=\"#f4d35e\"/></svg>\n",
        cx = width / 2,
        cy = height / 2,
        rx = width / 3,
        ry = height / 3,
    )
}

/// Flattened 8-bit RGB document with raw planar image data. Red is 30, green
/// encodes the row (`y * 4`), blue is 200.
pub fn psd_fixture(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"8BPS");
    bytes.extend_from_slice(&1u16.to_be_bytes());
    bytes.extend_from_slice(&[0; 6]);
    bytes.extend_from_slice(&3u16.to_be_bytes());
    bytes.extend_from_slice(&height.to_be_bytes());
    bytes.extend_from_slice(&width.to_be_bytes());
    bytes.extend_from_slice(&8u16.to_be_bytes());
    bytes.extend_from_slice(&3u16.to_be_bytes());
    // color mode data, image resources
    bytes.extend_from_slice(&0u32.to_be_bytes());
    bytes.extend_from_slice(&0u32.to_be_bytes());
    // layer and mask info: empty layer info and global mask
    bytes.extend_from_slice(&8u32.to_be_bytes());
    bytes.extend_from_slice(&[0; 8]);
    // image data, uncompressed planes
    bytes.extend_from_slice(&0u16.to_be_bytes());
    let pixels = (width * height) as usize;
    bytes.extend(std::iter::repeat_n(30u8, pixels));
    for y in 0..height {
        bytes.extend(std::iter::repeat_n((y * 4) as u8, width as usize));
    }
    bytes.extend(std::iter::repeat_n(200u8, pixels));
    bytes
}

/// Engine whose every forward pass fails like a lost device.
pub struct FailingEngine;

impl InferenceEngine for FailingEngine {
    fn forward(&self, _input: &InputTensor) -> Result<Vec<f32>, EngineError> {
        Err(EngineError::Runtime("device lost".into()))
    }

    fn parameter_count(&self) -> usize {
        0
    }

    fn device(&self) -> String {
        "cpu".into()
    }
}

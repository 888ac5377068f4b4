use image::{DynamicImage, RgbImage, RgbaImage};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use crate::formats::ImageEncoding;

/// Largest canvas a vector image may be rasterized to.
const MAX_CANVAS_SIDE: u32 = 16_384;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error("{0}")]
    Malformed(String),
    #[error("{0} support is not compiled into this build")]
    NotCompiled(ImageEncoding),
    #[error("{0} decoder crashed on this input")]
    Crashed(ImageEncoding),
}

/// Decodes `bytes` as `encoding`. Raster encodings go through the image crate;
/// containers it cannot read have dedicated decoders. RAW decoding reads from
/// `path` since the raw pipeline works on files.
pub fn decode(
    encoding: ImageEncoding,
    bytes: &[u8],
    path: &Path,
) -> Result<DynamicImage, DecodeError> {
    if let Some(format) = encoding.image_format() {
        return Ok(image::load_from_memory_with_format(bytes, format)?);
    }
    // third-party container parsers may panic on hostile input
    panic::catch_unwind(AssertUnwindSafe(|| match encoding {
        ImageEncoding::Svg => rasterize_svg(bytes),
        ImageEncoding::Psd => flatten_psd(bytes),
        ImageEncoding::Heic | ImageEncoding::Heif => decode_heif(encoding, bytes),
        ImageEncoding::Raw => develop_raw(path),
        other => Err(DecodeError::NotCompiled(other)),
    }))
    .unwrap_or(Err(DecodeError::Crashed(encoding)))
}

fn rasterize_svg(bytes: &[u8]) -> Result<DynamicImage, DecodeError> {
    use resvg::{tiny_skia, usvg};

    let tree = usvg::Tree::from_data(bytes, &usvg::Options::default())
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let size = tree.size().to_int_size();
    if size.width() > MAX_CANVAS_SIDE || size.height() > MAX_CANVAS_SIDE {
        return Err(DecodeError::Malformed(format!(
            "canvas {}x{} exceeds {MAX_CANVAS_SIDE}px",
            size.width(),
            size.height()
        )));
    }
    let mut pixmap = tiny_skia::Pixmap::new(size.width(), size.height())
        .ok_or_else(|| DecodeError::Malformed("empty canvas".into()))?;
    resvg::render(&tree, tiny_skia::Transform::default(), &mut pixmap.as_mut());

    let rgba: Vec<u8> = pixmap
        .pixels()
        .iter()
        .flat_map(|pixel| {
            let c = pixel.demultiply();
            [c.red(), c.green(), c.blue(), c.alpha()]
        })
        .collect();
    RgbaImage::from_raw(size.width(), size.height(), rgba)
        .map(DynamicImage::ImageRgba8)
        .ok_or_else(|| DecodeError::Malformed("rasterized buffer has the wrong size".into()))
}

fn flatten_psd(bytes: &[u8]) -> Result<DynamicImage, DecodeError> {
    let psd = psd::Psd::from_bytes(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    RgbaImage::from_raw(psd.width(), psd.height(), psd.rgba())
        .map(DynamicImage::ImageRgba8)
        .ok_or_else(|| DecodeError::Malformed("composite has the wrong size".into()))
}

#[cfg(feature = "heif")]
fn decode_heif(_encoding: ImageEncoding, bytes: &[u8]) -> Result<DynamicImage, DecodeError> {
    use libheif_rs::{ColorSpace, HeifContext, LibHeif, RgbChroma};

    let malformed = |e: libheif_rs::HeifError| DecodeError::Malformed(e.to_string());
    let lib = LibHeif::new();
    let context = HeifContext::read_from_bytes(bytes).map_err(malformed)?;
    let handle = context.primary_image_handle().map_err(malformed)?;
    let decoded = lib
        .decode(&handle, ColorSpace::Rgb(RgbChroma::Rgb), None)
        .map_err(malformed)?;
    let plane = decoded
        .planes()
        .interleaved
        .ok_or_else(|| DecodeError::Malformed("no interleaved RGB plane".into()))?;

    let (width, height) = (plane.width, plane.height);
    let row = width as usize * 3;
    let mut rgb = Vec::with_capacity(row * height as usize);
    for line in plane.data.chunks(plane.stride).take(height as usize) {
        rgb.extend_from_slice(&line[..row]);
    }
    RgbImage::from_raw(width, height, rgb)
        .map(DynamicImage::ImageRgb8)
        .ok_or_else(|| DecodeError::Malformed("decoded plane has the wrong size".into()))
}

#[cfg(not(feature = "heif"))]
fn decode_heif(encoding: ImageEncoding, _bytes: &[u8]) -> Result<DynamicImage, DecodeError> {
    Err(DecodeError::NotCompiled(encoding))
}

#[cfg(feature = "raw")]
fn develop_raw(path: &Path) -> Result<DynamicImage, DecodeError> {
    let developed = imagepipe::simple_decode_8bit(path, 0, 0).map_err(DecodeError::Malformed)?;
    RgbImage::from_raw(
        developed.width as u32,
        developed.height as u32,
        developed.data,
    )
    .map(DynamicImage::ImageRgb8)
    .ok_or_else(|| DecodeError::Malformed("developed image has the wrong size".into()))
}

#[cfg(not(feature = "raw"))]
fn develop_raw(_path: &Path) -> Result<DynamicImage, DecodeError> {
    Err(DecodeError::NotCompiled(ImageEncoding::Raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{psd_fixture, svg_fixture};
    use image::GenericImageView;

    #[test]
    fn svg_is_rasterized_at_its_declared_size() {
        let image = decode(ImageEncoding::Svg, svg_fixture(120, 80).as_bytes(), Path::new("cell.svg"))
            .unwrap();
        assert_eq!(image.dimensions(), (120, 80));
        let center = image.to_rgba8().get_pixel(60, 40).0;
        assert_eq!(center[3], 255);
    }

    #[test]
    fn oversized_svg_canvas_is_refused() {
        let err = decode(
            ImageEncoding::Svg,
            svg_fixture(20_000, 10).as_bytes(),
            Path::new("huge.svg"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn psd_composite_is_flattened() {
        let image = decode(ImageEncoding::Psd, &psd_fixture(64, 48), Path::new("cell.psd")).unwrap();
        assert_eq!(image.dimensions(), (64, 48));
        let pixel = image.to_rgb8().get_pixel(3, 5).0;
        assert_eq!(pixel, [30, 5 * 4, 200]);
    }

    #[test]
    fn malformed_containers_are_errors() {
        assert!(decode(ImageEncoding::Svg, b"<svg", Path::new("bad.svg")).is_err());
        assert!(decode(ImageEncoding::Psd, b"8BPS\0\x01garbage", Path::new("bad.psd")).is_err());
    }

    #[cfg(not(feature = "heif"))]
    #[test]
    fn heif_without_decoder_reports_missing_support() {
        let err = decode(ImageEncoding::Heic, b"\0\0\0\x18ftypheic", Path::new("x.heic")).unwrap_err();
        assert!(matches!(err, DecodeError::NotCompiled(ImageEncoding::Heic)));
    }
}

use image::ImageFormat;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::str::FromStr;
use strum::{Display, EnumString};

/// Upload extensions accepted by the HTTP layer, in the order they are reported.
pub const ALLOWED_EXTENSIONS: [&str; 12] = [
    "png", "jpg", "jpeg", "gif", "bmp", "tiff", "webp", "heic", "heif", "raw", "svg", "psd",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ImageEncoding {
    #[strum(to_string = "jpeg", serialize = "jpg")]
    Jpeg,
    Png,
    Gif,
    Bmp,
    Tiff,
    Webp,
    Heic,
    Heif,
    Raw,
    Svg,
    Psd,
}

impl ImageEncoding {
    /// Codec backing this encoding, if the image crate can read or write it.
    pub fn image_format(self) -> Option<ImageFormat> {
        match self {
            ImageEncoding::Jpeg => Some(ImageFormat::Jpeg),
            ImageEncoding::Png => Some(ImageFormat::Png),
            ImageEncoding::Gif => Some(ImageFormat::Gif),
            ImageEncoding::Bmp => Some(ImageFormat::Bmp),
            ImageEncoding::Tiff => Some(ImageFormat::Tiff),
            ImageEncoding::Webp => Some(ImageFormat::WebP),
            ImageEncoding::Heic
            | ImageEncoding::Heif
            | ImageEncoding::Raw
            | ImageEncoding::Svg
            | ImageEncoding::Psd => None,
        }
    }

    pub fn from_image_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Jpeg => Some(ImageEncoding::Jpeg),
            ImageFormat::Png => Some(ImageEncoding::Png),
            ImageFormat::Gif => Some(ImageEncoding::Gif),
            ImageFormat::Bmp => Some(ImageEncoding::Bmp),
            ImageFormat::Tiff => Some(ImageEncoding::Tiff),
            ImageFormat::WebP => Some(ImageEncoding::Webp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FormatRule {
    encoding: ImageEncoding,
    target: ImageEncoding,
}

impl FormatRule {
    const fn native(encoding: ImageEncoding) -> Self {
        Self { encoding, target: encoding }
    }

    const fn transcode(encoding: ImageEncoding, target: ImageEncoding) -> Self {
        Self { encoding, target }
    }

    fn requires_transcoding(&self) -> bool {
        self.encoding != self.target
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Canonicalization {
    Native(ImageEncoding),
    Transcode { from: ImageEncoding, to: ImageEncoding },
    Unsupported,
}

lazy_static! {
    static ref FORMAT_RULES: HashMap<ImageEncoding, FormatRule> = {
        use ImageEncoding::*;
        [
            FormatRule::native(Jpeg),
            FormatRule::native(Png),
            FormatRule::native(Gif),
            FormatRule::native(Bmp),
            FormatRule::native(Tiff),
            FormatRule::transcode(Webp, Png),
            FormatRule::transcode(Heic, Jpeg),
            FormatRule::transcode(Heif, Jpeg),
            FormatRule::transcode(Raw, Jpeg),
            FormatRule::transcode(Svg, Png),
            FormatRule::transcode(Psd, Png),
        ]
        .into_iter()
        .map(|rule| (rule.encoding, rule))
        .collect()
    };
}

fn normalize(extension_or_format: &str) -> String {
    extension_or_format
        .trim()
        .trim_start_matches('.')
        .to_ascii_lowercase()
}

fn rule_for(extension_or_format: &str) -> Option<FormatRule> {
    let encoding = ImageEncoding::from_str(&normalize(extension_or_format)).ok()?;
    FORMAT_RULES.get(&encoding).copied()
}

/// Resolves an extension or declared format name to the encoding the
/// classifier pipeline should consume.
pub fn canonicalize(extension_or_format: &str) -> Canonicalization {
    match rule_for(extension_or_format) {
        Some(rule) if rule.requires_transcoding() => Canonicalization::Transcode {
            from: rule.encoding,
            to: rule.target,
        },
        Some(rule) => Canonicalization::Native(rule.encoding),
        None => Canonicalization::Unsupported,
    }
}

pub fn requires_transcoding(extension_or_format: &str) -> bool {
    matches!(
        canonicalize(extension_or_format),
        Canonicalization::Transcode { .. }
    )
}

pub fn allowed_extensions() -> Vec<String> {
    ALLOWED_EXTENSIONS.iter().map(|ext| ext.to_string()).collect()
}

/// Lowercased extension after the last dot, if any.
pub fn extension_of(filename: &str) -> Option<String> {
    let (_, ext) = filename.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn is_allowed_file(filename: &str) -> bool {
    extension_of(filename)
        .map(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// What the leading bytes of a payload identify it as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    Known(ImageEncoding),
    /// A raster the image crate reads that the registry does not list.
    Foreign(ImageFormat),
}

impl Signature {
    pub fn extension(self) -> String {
        match self {
            Signature::Known(encoding) => encoding.to_string(),
            Signature::Foreign(format) => format
                .extensions_str()
                .first()
                .map(|ext| ext.to_string())
                .unwrap_or_else(|| "bin".to_string()),
        }
    }
}

const HEIC_BRANDS: [&[u8; 4]; 6] = [b"heic", b"heix", b"hevc", b"hevx", b"heim", b"heis"];
const HEIF_BRANDS: [&[u8; 4]; 2] = [b"mif1", b"msf1"];
const RAW_MAGIC: [&[u8]; 5] = [b"FUJIFILMCCD-RAW", b"IIRO", b"IIRS", b"IIU\0", b"MMOR"];

/// Content sniffing on the leading bytes of a file. Raster signatures come
/// from the image crate; container formats it cannot read are matched here.
pub fn sniff(bytes: &[u8]) -> Option<Signature> {
    if let Some(encoding) = sniff_container(bytes) {
        return Some(Signature::Known(encoding));
    }
    let format = image::guess_format(bytes).ok()?;
    Some(match ImageEncoding::from_image_format(format) {
        Some(encoding) => Signature::Known(encoding),
        None => Signature::Foreign(format),
    })
}

fn sniff_container(bytes: &[u8]) -> Option<ImageEncoding> {
    if bytes.starts_with(b"8BPS") {
        return Some(ImageEncoding::Psd);
    }
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        let brand = &bytes[8..12];
        if HEIC_BRANDS.iter().any(|b| b.as_slice() == brand) {
            return Some(ImageEncoding::Heic);
        }
        if HEIF_BRANDS.iter().any(|b| b.as_slice() == brand) {
            return Some(ImageEncoding::Heif);
        }
        if brand == b"crx " {
            return Some(ImageEncoding::Raw);
        }
    }
    if RAW_MAGIC.iter().any(|magic| bytes.starts_with(magic)) {
        return Some(ImageEncoding::Raw);
    }
    if looks_like_svg(bytes) {
        return Some(ImageEncoding::Svg);
    }
    None
}

fn looks_like_svg(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(1024)];
    let Ok(text) = std::str::from_utf8(head) else {
        return false;
    };
    let text = text.trim_start_matches('\u{feff}').trim_start();
    (text.starts_with("<?xml") || text.starts_with("<svg") || text.starts_with("<!DOCTYPE svg"))
        && text.contains("<svg")
}

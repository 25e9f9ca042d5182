use std::io::Cursor;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use refinery_contracts::events::EvidenceItem;

use crate::error::IntakeError;
use crate::gateway::InlineImage;

/// MIME type assumed when neither the content nor the filename identify the format.
pub const FALLBACK_MIME: &str = "image/jpeg";
pub const DEFAULT_MAX_MODEL_DIM: u32 = 2048;

const MODEL_JPEG_QUALITY: u8 = 90;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }

    /// Browsers send one nameless, empty part for an untouched file input.
    fn is_placeholder(&self) -> bool {
        self.filename.trim().is_empty() && self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntakeOptions {
    /// Longest side sent to the model; 0 sends originals untouched.
    pub max_model_dim: u32,
}

impl Default for IntakeOptions {
    fn default() -> Self {
        Self {
            max_model_dim: DEFAULT_MAX_MODEL_DIM,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceImage {
    pub filename: String,
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub byte_len: usize,
    pub display_base64: String,
}

/// Ordered, immutable set of decoded uploads for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceSet {
    images: Vec<EvidenceImage>,
    parts: Vec<InlineImage>,
}

impl EvidenceSet {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn images(&self) -> &[EvidenceImage] {
        &self.images
    }

    /// Images as attached to model requests, in submission order.
    pub fn model_parts(&self) -> &[InlineImage] {
        &self.parts
    }

    pub fn summary_items(&self, include_data: bool) -> Vec<EvidenceItem> {
        self.images
            .iter()
            .map(|image| EvidenceItem {
                filename: image.filename.clone(),
                mime: image.mime.clone(),
                width: image.width,
                height: image.height,
                bytes: image.byte_len,
                data_base64: include_data.then(|| image.display_base64.clone()),
            })
            .collect()
    }
}

/// Decode every upload, in order. The first unreadable file fails the whole batch.
pub fn intake(files: Vec<UploadedFile>, options: &IntakeOptions) -> Result<EvidenceSet, IntakeError> {
    let files = files
        .into_iter()
        .filter(|file| !file.is_placeholder())
        .collect::<Vec<UploadedFile>>();
    if files.is_empty() {
        return Err(IntakeError::NoInput);
    }

    let mut images = Vec::with_capacity(files.len());
    let mut parts = Vec::with_capacity(files.len());
    for file in files {
        let decoded = image::load_from_memory(&file.bytes).map_err(|err| IntakeError::Decode {
            filename: file.filename.clone(),
            reason: err.to_string(),
        })?;
        let mime = infer_mime(&file.filename, &file.bytes);
        let part = prepare_model_part(&decoded, &file.bytes, &mime, options.max_model_dim)
            .map_err(|reason| IntakeError::Decode {
                filename: file.filename.clone(),
                reason,
            })?;
        images.push(EvidenceImage {
            width: decoded.width(),
            height: decoded.height(),
            byte_len: file.bytes.len(),
            display_base64: BASE64.encode(&file.bytes),
            filename: file.filename,
            mime,
        });
        parts.push(part);
    }
    Ok(EvidenceSet { images, parts })
}

/// Content sniffing first, then the filename extension, then [`FALLBACK_MIME`].
pub fn infer_mime(filename: &str, bytes: &[u8]) -> String {
    if let Ok(format) = image::guess_format(bytes) {
        return format.to_mime_type().to_string();
    }
    mime_for_path(Path::new(filename))
        .unwrap_or(FALLBACK_MIME)
        .to_string()
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "tif" | "tiff" => Some("image/tiff"),
        _ => None,
    }
}

fn prepare_model_part(
    decoded: &DynamicImage,
    original: &[u8],
    mime: &str,
    max_dim: u32,
) -> Result<InlineImage, String> {
    if max_dim == 0 || decoded.width().max(decoded.height()) <= max_dim {
        return Ok(InlineImage {
            mime: mime.to_string(),
            data_base64: BASE64.encode(original),
        });
    }

    let resized = decoded.resize(max_dim, max_dim, FilterType::Triangle);
    let flattened = flatten_on_white(&resized);
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(Cursor::new(&mut bytes), MODEL_JPEG_QUALITY)
        .encode_image(&DynamicImage::ImageRgb8(flattened))
        .map_err(|err| err.to_string())?;
    Ok(InlineImage {
        mime: "image/jpeg".to_string(),
        data_base64: BASE64.encode(bytes),
    })
}

fn flatten_on_white(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    flattened
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use base64::Engine as _;
    use image::{ImageFormat, Rgba, RgbaImage};

    use super::*;

    fn png_bytes(width: u32, height: u32, shade: u8) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, height, Rgba([shade, 10, 200, 128]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn intake_preserves_submission_order() -> anyhow::Result<()> {
        let files = vec![
            UploadedFile::new("c.png", png_bytes(3, 1, 1)),
            UploadedFile::new("a.png", png_bytes(1, 2, 2)),
            UploadedFile::new("b.png", png_bytes(2, 3, 3)),
        ];
        let originals: Vec<Vec<u8>> = files.iter().map(|file| file.bytes.clone()).collect();

        let evidence = intake(files, &IntakeOptions::default())?;
        assert_eq!(evidence.len(), 3);
        assert_eq!(evidence.model_parts().len(), 3);

        let names: Vec<&str> = evidence
            .images()
            .iter()
            .map(|image| image.filename.as_str())
            .collect();
        assert_eq!(names, vec!["c.png", "a.png", "b.png"]);

        for (image, original) in evidence.images().iter().zip(&originals) {
            assert_eq!(&BASE64.decode(&image.display_base64)?, original);
        }
        assert_eq!(evidence.images()[2].width, 2);
        assert_eq!(evidence.images()[2].height, 3);
        assert_eq!(evidence.images()[0].mime, "image/png");
        Ok(())
    }

    #[test]
    fn empty_submission_is_rejected() {
        assert_eq!(
            intake(Vec::new(), &IntakeOptions::default()),
            Err(IntakeError::NoInput)
        );
        assert_eq!(
            intake(
                vec![UploadedFile::new("", Vec::new())],
                &IntakeOptions::default()
            ),
            Err(IntakeError::NoInput)
        );
    }

    #[test]
    fn one_bad_file_aborts_the_batch() {
        let files = vec![
            UploadedFile::new("good.png", png_bytes(2, 2, 9)),
            UploadedFile::new("notes.txt", b"not an image".to_vec()),
        ];
        match intake(files, &IntakeOptions::default()) {
            Err(IntakeError::Decode { filename, .. }) => assert_eq!(filename, "notes.txt"),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn oversized_images_are_downscaled_for_the_model_only() -> anyhow::Result<()> {
        let bytes = png_bytes(64, 16, 40);
        let evidence = intake(
            vec![UploadedFile::new("wide.png", bytes.clone())],
            &IntakeOptions { max_model_dim: 32 },
        )?;

        let part = &evidence.model_parts()[0];
        assert_eq!(part.mime, "image/jpeg");
        let sent = image::load_from_memory(&BASE64.decode(&part.data_base64)?)?;
        assert_eq!(sent.width(), 32);
        assert_eq!(sent.height(), 8);

        assert_eq!(BASE64.decode(&evidence.images()[0].display_base64)?, bytes);
        assert_eq!(evidence.images()[0].width, 64);
        Ok(())
    }

    #[test]
    fn mime_falls_back_to_extension_then_default() {
        assert_eq!(infer_mime("scan.WEBP", b"??"), "image/webp");
        assert_eq!(infer_mime("scan.bin", b"??"), FALLBACK_MIME);
        assert_eq!(infer_mime("mislabeled.jpg", &png_bytes(1, 1, 0)), "image/png");
    }

    #[test]
    fn summary_items_only_carry_data_on_request() -> anyhow::Result<()> {
        let evidence = intake(
            vec![UploadedFile::new("a.png", png_bytes(2, 2, 5))],
            &IntakeOptions::default(),
        )?;
        assert!(evidence.summary_items(false)[0].data_base64.is_none());
        assert!(evidence.summary_items(true)[0].data_base64.is_some());
        Ok(())
    }
}

use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{DynamicImage, ImageFormat, imageops::FilterType};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{FlowError, Result};

pub const ACCEPTED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
pub const PREVIEW_WIDTH: u32 = 512;

/// Raw bytes of one uploaded file.
#[derive(Clone)]
pub struct UploadedImage {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl UploadedImage {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }
}

impl std::fmt::Debug for UploadedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadedImage")
            .field("file_name", &self.file_name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub file_name: String,
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub size_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePreview {
    pub metadata: ImageMetadata,
    /// `data:image/png;base64,...` thumbnail suitable for an `<img>` tag.
    pub data_url: String,
}

/// Decodes the upload and reports its format and dimensions.
pub fn inspect(upload: &UploadedImage) -> Result<ImageMetadata> {
    let (format, image) = decode(upload)?;
    Ok(ImageMetadata {
        file_name: upload.file_name.clone(),
        format: format_name(format).to_string(),
        width: image.width(),
        height: image.height(),
        size_bytes: upload.bytes.len(),
    })
}

/// Metadata plus a PNG thumbnail no wider than `max_width`.
pub fn preview(upload: &UploadedImage, max_width: u32) -> Result<ImagePreview> {
    let (format, image) = decode(upload)?;
    let metadata = ImageMetadata {
        file_name: upload.file_name.clone(),
        format: format_name(format).to_string(),
        width: image.width(),
        height: image.height(),
        size_bytes: upload.bytes.len(),
    };

    let thumbnail = if image.width() > max_width {
        let height = ((image.height() as f64) * (max_width as f64) / (image.width() as f64))
            .round()
            .max(1.0) as u32;
        image.resize_exact(max_width, height, FilterType::Triangle)
    } else {
        image
    };

    let mut buffer = Vec::new();
    thumbnail
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .map_err(|e| FlowError::UnsupportedImage {
            file_name: upload.file_name.clone(),
            reason: format!("failed to encode preview: {}", e),
        })?;

    Ok(ImagePreview {
        metadata,
        data_url: format!("data:image/png;base64,{}", STANDARD.encode(&buffer)),
    })
}

/// Temp copies of the uploads. The files are removed when this value drops.
pub struct StagedImages {
    files: Vec<NamedTempFile>,
}

impl StagedImages {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.path().to_path_buf()).collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Drop for StagedImages {
    fn drop(&mut self) {
        debug!("Removing {} staged image(s)", self.files.len());
    }
}

/// Writes every upload to its own temp file under `dir`.
pub fn stage(uploads: &[UploadedImage], dir: &Path) -> Result<StagedImages> {
    let mut files = Vec::with_capacity(uploads.len());
    for upload in uploads {
        let extension = extension_of(&upload.file_name).unwrap_or("png");
        let mut file = tempfile::Builder::new()
            .prefix("upload_")
            .suffix(&format!(".{}", extension))
            .tempfile_in(dir)?;
        file.write_all(&upload.bytes)?;
        file.flush()?;
        files.push(file);
    }
    info!("Staged {} image(s) in {}", files.len(), dir.display());
    Ok(StagedImages { files })
}

fn decode(upload: &UploadedImage) -> Result<(ImageFormat, DynamicImage)> {
    let unsupported = |reason: String| FlowError::UnsupportedImage {
        file_name: upload.file_name.clone(),
        reason,
    };

    if extension_of(&upload.file_name).is_none() {
        return Err(unsupported("only JPG, JPEG and PNG files are accepted".into()));
    }
    if upload.bytes.is_empty() {
        return Err(unsupported("file is empty".into()));
    }

    let format = image::guess_format(&upload.bytes).map_err(|e| unsupported(e.to_string()))?;
    if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
        return Err(unsupported(format!(
            "content is {} rather than JPEG or PNG",
            format_name(format)
        )));
    }

    let image = image::load_from_memory_with_format(&upload.bytes, format)
        .map_err(|e| unsupported(e.to_string()))?;
    Ok((format, image))
}

fn extension_of(file_name: &str) -> Option<&'static str> {
    let ext = Path::new(file_name).extension()?.to_str()?.to_ascii_lowercase();
    ACCEPTED_EXTENSIONS.iter().copied().find(|accepted| *accepted == ext)
}

fn format_name(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "PNG",
        ImageFormat::Jpeg => "JPEG",
        ImageFormat::Gif => "GIF",
        ImageFormat::WebP => "WEBP",
        ImageFormat::Bmp => "BMP",
        ImageFormat::Tiff => "TIFF",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([40, 40, 40])));
        let mut buffer = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .unwrap();
        buffer
    }

    #[test]
    fn inspect_reports_format_and_dimensions() {
        let upload = UploadedImage::new("chest.PNG", png_bytes(64, 32));
        let metadata = inspect(&upload).unwrap();
        assert_eq!(metadata.format, "PNG");
        assert_eq!((metadata.width, metadata.height), (64, 32));
        assert_eq!(metadata.file_name, "chest.PNG");
    }

    #[test]
    fn rejects_unaccepted_extension() {
        let upload = UploadedImage::new("scan.gif", png_bytes(4, 4));
        assert!(matches!(
            inspect(&upload),
            Err(FlowError::UnsupportedImage { .. })
        ));
    }

    #[test]
    fn rejects_garbage_bytes() {
        let upload = UploadedImage::new("scan.jpg", b"not an image".to_vec());
        assert!(inspect(&upload).is_err());
        let empty = UploadedImage::new("scan.jpg", Vec::new());
        assert!(inspect(&empty).is_err());
    }

    #[test]
    fn preview_downscales_wide_images() {
        let upload = UploadedImage::new("knee.png", png_bytes(1024, 256));
        let preview = preview(&upload, PREVIEW_WIDTH).unwrap();
        assert_eq!(preview.metadata.width, 1024);
        assert!(preview.data_url.starts_with("data:image/png;base64,"));

        let encoded = preview.data_url.trim_start_matches("data:image/png;base64,");
        let thumb = image::load_from_memory(&STANDARD.decode(encoded).unwrap()).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (512, 128));
    }

    #[test]
    fn staged_files_vanish_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = vec![
            UploadedImage::new("a.png", png_bytes(2, 2)),
            UploadedImage::new("b.jpeg", vec![1, 2, 3]),
        ];
        let staged = stage(&uploads, dir.path()).unwrap();
        let paths = staged.paths();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| p.exists()));
        assert!(paths[1].to_string_lossy().ends_with(".jpeg"));

        drop(staged);
        assert!(paths.iter().all(|p| !p.exists()));
    }
}

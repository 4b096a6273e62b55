use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, ImageReader, Limits, RgbImage};
use ndarray::Array3;
use std::io::Cursor;

use crate::config::{AppConfig, PreprocessingConfig};
use crate::error::PipelineError;

const SUPPORTED_FORMATS: [ImageFormat; 4] = [
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::Bmp,
    ImageFormat::Tiff,
];

/// Per-channel normalization pinned to a model version.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationProfile {
    pub version: String,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl NormalizationProfile {
    pub fn from_config(config: &PreprocessingConfig) -> Self {
        Self {
            version: config.version.clone(),
            mean: config.mean_array(),
            std: config.std_array(),
        }
    }

    pub fn normalize(&self, channel: usize, value: u8) -> f32 {
        (value as f32 / 255.0 - self.mean[channel]) / self.std[channel]
    }

    /// Values a normalized channel can take, from pixel 0 to pixel 255.
    pub fn channel_range(&self, channel: usize) -> (f32, f32) {
        (self.normalize(channel, 0), self.normalize(channel, 255))
    }
}

/// Model input, `height x width x channels`, already normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor(Array3<f32>);

impl InputTensor {
    pub fn new(data: Array3<f32>) -> Self {
        Self(data)
    }

    pub fn zeros(size: usize) -> Self {
        Self(Array3::zeros((size, size, 3)))
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.0.dim()
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.0
    }
}

/// Unnormalized RGB copy of the upload, used for rendering and overlays.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayImage(RgbImage);

impl DisplayImage {
    pub fn new(image: RgbImage) -> Self {
        Self(image)
    }

    pub fn image(&self) -> &RgbImage {
        &self.0
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    input_size: u32,
    equalize_histogram: bool,
    profile: NormalizationProfile,
    max_upload_bytes: usize,
    allowed_mime_types: Vec<String>,
    max_decoded_dimension: u32,
    max_display_dimension: u32,
}

impl Preprocessor {
    pub fn from_config(config: &AppConfig) -> Self {
        let preprocessing = &config.model.preprocessing;
        let profile = NormalizationProfile::from_config(preprocessing);
        log::debug!(
            "Normalization profile {} maps pixels to {:?}",
            profile.version,
            (0..3).map(|c| profile.channel_range(c)).collect::<Vec<_>>()
        );
        Self {
            input_size: preprocessing.input_size,
            equalize_histogram: preprocessing.equalize_histogram,
            profile,
            max_upload_bytes: config.upload.max_bytes,
            allowed_mime_types: config
                .upload
                .allowed_mime_types
                .iter()
                .map(|m| m.to_ascii_lowercase())
                .collect(),
            max_decoded_dimension: config.upload.max_decoded_dimension,
            max_display_dimension: config.display.max_dimension,
        }
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    pub fn profile(&self) -> &NormalizationProfile {
        &self.profile
    }

    pub fn preprocess(
        &self,
        bytes: &[u8],
        declared_mime: &str,
    ) -> Result<(InputTensor, DisplayImage), PipelineError> {
        self.validate(bytes, declared_mime)?;

        let rgb = self.decode(bytes)?.to_rgb8();
        let display = self.display_copy(&rgb);
        let tensor = self.to_tensor(rgb);

        log::debug!(
            "Preprocessed image: tensor {:?}, display {:?}, profile {}",
            tensor.shape(),
            display.dimensions(),
            self.profile.version
        );
        Ok((tensor, display))
    }

    /// Size and MIME checks; runs before any decoding.
    pub fn validate(&self, bytes: &[u8], declared_mime: &str) -> Result<(), PipelineError> {
        let mime = declared_mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if !self.allowed_mime_types.iter().any(|m| *m == mime) {
            return Err(PipelineError::InvalidInput(
                "Invalid file type. Please upload an image (JPEG, PNG, BMP or TIFF).".into(),
            ));
        }
        if bytes.is_empty() {
            return Err(PipelineError::InvalidInput("No file selected".into()));
        }
        if bytes.len() > self.max_upload_bytes {
            return Err(PipelineError::InvalidInput(format!(
                "File too large. Maximum size is {} MB.",
                self.max_upload_bytes / (1024 * 1024)
            )));
        }
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, PipelineError> {
        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| PipelineError::Decode(e.to_string()))?;

        match reader.format() {
            Some(format) if SUPPORTED_FORMATS.contains(&format) => {}
            Some(format) => {
                return Err(PipelineError::Decode(format!(
                    "unsupported image format {:?}",
                    format
                )));
            }
            None => return Err(PipelineError::Decode("unrecognized image data".into())),
        }

        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_decoded_dimension);
        limits.max_image_height = Some(self.max_decoded_dimension);
        reader.limits(limits);

        reader
            .decode()
            .map_err(|e| PipelineError::Decode(e.to_string()))
    }

    fn display_copy(&self, rgb: &RgbImage) -> DisplayImage {
        let (width, height) = rgb.dimensions();
        let longest = width.max(height);
        if longest <= self.max_display_dimension {
            return DisplayImage::new(rgb.clone());
        }

        let scale = self.max_display_dimension as f64 / longest as f64;
        let new_width = ((width as f64 * scale).round() as u32).max(1);
        let new_height = ((height as f64 * scale).round() as u32).max(1);
        DisplayImage::new(imageops::resize(
            rgb,
            new_width,
            new_height,
            FilterType::Triangle,
        ))
    }

    fn to_tensor(&self, rgb: RgbImage) -> InputTensor {
        let source = if self.equalize_histogram {
            let gray = DynamicImage::ImageRgb8(rgb).to_luma8();
            let equalized = imageproc::contrast::equalize_histogram(&gray);
            DynamicImage::ImageLuma8(equalized).to_rgb8()
        } else {
            rgb
        };

        let size = self.input_size;
        let resized = imageops::resize(&source, size, size, FilterType::Triangle);
        let data = Array3::from_shape_fn((size as usize, size as usize, 3), |(y, x, c)| {
            self.profile
                .normalize(c, resized.get_pixel(x as u32, y as u32)[c])
        });
        InputTensor::new(data)
    }
}

//! Image encoder abstraction
//!
//! Each target format has one [`ImageEncoder`]. Encoders take a decoded
//! image and return encoded bytes; they never see the source file or the
//! cache directory.

use image::{DynamicImage, ImageFormat, ImageOutputFormat};
use std::io::Cursor;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use super::error::TranscodeError;
use super::params::OutputFormat;

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Quality settings for image encoding
#[derive(Debug, Clone, Copy)]
pub struct EncoderQuality {
    /// Quality value (1-100, where 100 is best quality)
    pub quality: u8,
    /// Effort/speed trade-off (0-10, where 10 is slowest/best compression)
    pub effort: u8,
}

impl Default for EncoderQuality {
    fn default() -> Self {
        Self {
            quality: 80,
            effort: 4,
        }
    }
}

impl EncoderQuality {
    /// Create quality settings with specified quality level
    pub fn with_quality(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            effort: 4,
        }
    }

    /// Set the encoding effort (speed vs compression trade-off)
    pub fn with_effort(mut self, effort: u8) -> Self {
        self.effort = effort.clamp(0, 10);
        self
    }
}

/// Trait for image encoders
pub trait ImageEncoder: Send + Sync {
    /// The output format this encoder produces
    fn format(&self) -> OutputFormat;

    /// Encode a decoded image
    fn encode(&self, image: &DynamicImage, quality: EncoderQuality)
        -> Result<Vec<u8>, TranscodeError>;
}

/// Lossy WebP encoder backed by libwebp
pub struct WebPEncoder;

impl ImageEncoder for WebPEncoder {
    fn format(&self) -> OutputFormat {
        OutputFormat::WebP
    }

    fn encode(
        &self,
        image: &DynamicImage,
        quality: EncoderQuality,
    ) -> Result<Vec<u8>, TranscodeError> {
        let rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();
        let encoder = webp::Encoder::from_rgba(rgba.as_raw(), width, height);
        let encoded = encoder
            .encode_simple(false, quality.quality as f32)
            .map_err(|e| TranscodeError::encode_failed("webp", format!("{:?}", e)))?;
        Ok(encoded.to_vec())
    }
}

/// AVIF encoder backed by rav1e via ravif
pub struct AvifEncoder {
    /// Speed preset (1-10, where 1 is slowest/best quality)
    pub speed: u8,
}

impl Default for AvifEncoder {
    fn default() -> Self {
        Self { speed: 6 }
    }
}

impl ImageEncoder for AvifEncoder {
    fn format(&self) -> OutputFormat {
        OutputFormat::Avif
    }

    fn encode(
        &self,
        image: &DynamicImage,
        quality: EncoderQuality,
    ) -> Result<Vec<u8>, TranscodeError> {
        use rgb::FromSlice;

        let rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();
        let pixels = imgref::Img::new(
            rgba.as_raw().as_rgba(),
            width as usize,
            height as usize,
        );

        let encoded = ravif::Encoder::new()
            .with_quality(quality.quality as f32)
            .with_alpha_quality(quality.quality as f32)
            .with_speed(self.speed.clamp(1, 10))
            .encode_rgba(pixels)
            .map_err(|e| TranscodeError::encode_failed("avif", e.to_string()))?;

        Ok(encoded.avif_file)
    }
}

/// JPEG XL encoder delegating to an external `cjxl` binary
///
/// The image is handed over as a temporary PNG, so the tool sees lossless
/// input regardless of the source encoding. A run that outlives `timeout`
/// is killed.
#[derive(Debug, Clone)]
pub struct CommandEncoder {
    pub program: PathBuf,
    pub timeout: Duration,
}

impl Default for CommandEncoder {
    fn default() -> Self {
        Self {
            program: PathBuf::from(crate::constants::DEFAULT_JXL_ENCODER),
            timeout: Duration::from_secs(crate::constants::DEFAULT_ENCODE_TIMEOUT_SECS),
        }
    }
}

impl CommandEncoder {
    /// Wait for `child`, killing it once the deadline passes
    fn wait_with_deadline(&self, child: &mut Child) -> Result<ExitStatus, TranscodeError> {
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if started.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(
                    program = %self.program.display(),
                    pid = child.id(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Killed external encoder after timeout"
                );
                return Err(TranscodeError::ProcessingTimeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(CHILD_POLL_INTERVAL);
        }
    }
}

impl ImageEncoder for CommandEncoder {
    fn format(&self) -> OutputFormat {
        OutputFormat::Jxl
    }

    fn encode(
        &self,
        image: &DynamicImage,
        quality: EncoderQuality,
    ) -> Result<Vec<u8>, TranscodeError> {
        let input = tempfile::Builder::new().suffix(".png").tempfile()?;
        let output = tempfile::Builder::new().suffix(".jxl").tempfile()?;

        image
            .save_with_format(input.path(), ImageFormat::Png)
            .map_err(|e| TranscodeError::encode_failed("jxl", e.to_string()))?;

        let mut child = Command::new(&self.program)
            .arg(input.path())
            .arg(output.path())
            .arg("-q")
            .arg(quality.quality.to_string())
            .arg("--quiet")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                TranscodeError::encode_failed(
                    "jxl",
                    format!("failed to run {}: {}", self.program.display(), e),
                )
            })?;

        let status = self.wait_with_deadline(&mut child)?;
        if !status.success() {
            return Err(TranscodeError::encode_failed(
                "jxl",
                format!("{} exited with {}", self.program.display(), status),
            ));
        }

        Ok(std::fs::read(output.path())?)
    }
}

/// Re-encodes into the source's own format (used for resized originals)
pub struct OriginalEncoder {
    pub source_format: ImageFormat,
}

impl ImageEncoder for OriginalEncoder {
    fn format(&self) -> OutputFormat {
        OutputFormat::Original
    }

    fn encode(
        &self,
        image: &DynamicImage,
        quality: EncoderQuality,
    ) -> Result<Vec<u8>, TranscodeError> {
        let output_format = match self.source_format {
            ImageFormat::Jpeg => ImageOutputFormat::Jpeg(quality.quality),
            ImageFormat::Png => ImageOutputFormat::Png,
            ImageFormat::Gif => ImageOutputFormat::Gif,
            ImageFormat::Bmp => ImageOutputFormat::Bmp,
            other => {
                return Err(TranscodeError::unsupported_format(
                    format!("{:?}", other),
                    "raw",
                ))
            }
        };

        // JPEG cannot carry alpha
        let image = if self.source_format == ImageFormat::Jpeg {
            DynamicImage::ImageRgb8(image.to_rgb8())
        } else {
            image.clone()
        };

        let mut output = Cursor::new(Vec::new());
        image
            .write_to(&mut output, output_format)
            .map_err(|e| TranscodeError::encode_failed("raw", e.to_string()))?;
        Ok(output.into_inner())
    }
}

/// Factory for creating encoders based on output format
pub struct EncoderFactory;

impl EncoderFactory {
    /// Create an encoder for the specified output format.
    /// `source_format` is only consulted for [`OutputFormat::Original`].
    pub fn create(
        format: OutputFormat,
        source_format: ImageFormat,
        jxl: &CommandEncoder,
    ) -> Box<dyn ImageEncoder> {
        match format {
            OutputFormat::WebP => Box::new(WebPEncoder),
            OutputFormat::Avif => Box::new(AvifEncoder::default()),
            OutputFormat::Jxl => Box::new(jxl.clone()),
            OutputFormat::Original => Box::new(OriginalEncoder { source_format }),
        }
    }
}

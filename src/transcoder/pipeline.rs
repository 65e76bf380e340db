//! Image processing implementation
//!
//! decode → orient → resize/crop → encode

use fast_image_resize::{FilterType, Image, PixelType, ResizeAlg, Resizer};
use image::io::Reader as ImageReader;
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::io::Cursor;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use super::encoder::{CommandEncoder, EncoderFactory, EncoderQuality};
use crate::constants::{MAX_RESIZE_DIMENSION, MAX_RESIZE_PIXELS};
use super::error::TranscodeError;
use super::params::{CropStrategy, ExtraParams, OutputFormat};
use super::{TranscodeJob, Transform};

/// Default [`Transform`]: decodes with `image`, resizes with
/// `fast_image_resize`, encodes with the format's [`super::ImageEncoder`]
#[derive(Debug, Default, Clone)]
pub struct ImagePipeline {
    /// External JPEG XL encoder and its deadline
    pub jxl: CommandEncoder,
}

impl ImagePipeline {
    pub fn new(jxl_program: Option<PathBuf>, external_timeout: Duration) -> Self {
        let mut jxl = CommandEncoder {
            timeout: external_timeout,
            ..Default::default()
        };
        if let Some(program) = jxl_program {
            jxl.program = program;
        }
        Self { jxl }
    }
}

impl Transform for ImagePipeline {
    fn transform(&self, source: &[u8], job: &TranscodeJob) -> Result<Vec<u8>, TranscodeError> {
        let source_format = detect_format(source, &job.source_type, job.format)?;

        let mut img = decode_image(source, source_format)?;

        let keep_exif = !job.strip_metadata
            && job.format == OutputFormat::Original
            && source_format == ImageFormat::Jpeg;

        // Pixel encoders cannot carry the orientation tag, so bake it in
        // unless the original EXIF segment travels with the output
        if !keep_exif {
            if let Some(orientation) = read_orientation(source) {
                img = apply_orientation(img, orientation);
            }
        }

        if let Some(extra) = job.extra.filter(|e| !e.is_empty()) {
            img = apply_extra_params(img, &extra, job.crop)?;
        }

        if let Some(max) = job.format.max_dimension() {
            let (width, height) = img.dimensions();
            if width > max || height > max {
                return Err(TranscodeError::DimensionsTooLarge {
                    format: job.format.to_string(),
                    width,
                    height,
                    max,
                });
            }
        }

        let encoder = EncoderFactory::create(job.format, source_format, &self.jxl);
        let encoded = encoder.encode(&img, EncoderQuality::with_quality(job.quality))?;

        if keep_exif {
            Ok(copy_exif_segment(source, encoded))
        } else {
            Ok(encoded)
        }
    }
}

/// Work out the source encoding, rejecting types the decoder cannot handle
fn detect_format(
    data: &[u8],
    source_type: &str,
    target: OutputFormat,
) -> Result<ImageFormat, TranscodeError> {
    let format = image::guess_format(data)
        .ok()
        .or_else(|| ImageFormat::from_extension(source_type));

    match format {
        Some(
            f @ (ImageFormat::Jpeg
            | ImageFormat::Png
            | ImageFormat::Gif
            | ImageFormat::Bmp
            | ImageFormat::WebP),
        ) => Ok(f),
        _ => Err(TranscodeError::unsupported_format(
            source_type,
            target.as_str(),
        )),
    }
}

/// Decode image data into a DynamicImage
fn decode_image(data: &[u8], format: ImageFormat) -> Result<DynamicImage, TranscodeError> {
    let mut reader = ImageReader::new(Cursor::new(data));
    reader.set_format(format);
    reader
        .decode()
        .map_err(|e| TranscodeError::decode_failed(e.to_string()))
}

/// EXIF orientation tag (1-8) if present
fn read_orientation(data: &[u8]) -> Option<u32> {
    let exif = exif::Reader::new()
        .read_from_container(&mut Cursor::new(data))
        .ok()?;
    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
}

fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Insert the source's APP1 Exif segment right after the output's SOI marker
fn copy_exif_segment(source: &[u8], mut output: Vec<u8>) -> Vec<u8> {
    let Some(segment) = find_exif_segment(source) else {
        return output;
    };
    if output.len() < 2 || output[0..2] != [0xFF, 0xD8] {
        return output;
    }
    output.splice(2..2, segment.iter().copied());
    output
}

fn find_exif_segment(jpeg: &[u8]) -> Option<&[u8]> {
    if jpeg.len() < 4 || jpeg[0..2] != [0xFF, 0xD8] {
        return None;
    }
    let mut pos = 2;
    while pos + 4 <= jpeg.len() {
        if jpeg[pos] != 0xFF {
            return None;
        }
        let marker = jpeg[pos + 1];
        // Start of scan: no more metadata segments
        if marker == 0xDA {
            return None;
        }
        let len = u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]) as usize;
        let end = pos + 2 + len;
        if end > jpeg.len() {
            return None;
        }
        if marker == 0xE1 && jpeg[pos + 4..end].starts_with(b"Exif\0\0") {
            return Some(&jpeg[pos..end]);
        }
        pos = end;
    }
    None
}

/// Apply width/height/max bounds
fn apply_extra_params(
    img: DynamicImage,
    extra: &ExtraParams,
    crop: CropStrategy,
) -> Result<DynamicImage, TranscodeError> {
    let (src_w, src_h) = img.dimensions();

    let img = match (extra.width, extra.height) {
        (0, 0) => img,
        (w, 0) => {
            let h = scale_other_side(src_h, src_w, w);
            resize_image(&img, w, h)?
        }
        (0, h) => {
            let w = scale_other_side(src_w, src_h, h);
            resize_image(&img, w, h)?
        }
        (w, h) if crop == CropStrategy::None => {
            let (fw, fh) = fit_within(src_w, src_h, w, h);
            resize_image(&img, fw, fh)?
        }
        (w, h) => crop_to_fill(&img, w, h, crop)?,
    };

    let (cur_w, cur_h) = img.dimensions();
    let max_w = if extra.max_width == 0 { cur_w } else { extra.max_width };
    let max_h = if extra.max_height == 0 { cur_h } else { extra.max_height };
    if cur_w > max_w || cur_h > max_h {
        let (fw, fh) = fit_within(cur_w, cur_h, max_w, max_h);
        return resize_image(&img, fw, fh);
    }

    Ok(img)
}

/// New length of the side that was not specified, preserving aspect ratio
fn scale_other_side(other: u32, specified_src: u32, specified_target: u32) -> u32 {
    let scaled = other as f64 * specified_target as f64 / specified_src.max(1) as f64;
    (scaled.round() as u32).max(1)
}

/// Largest size with the source's aspect ratio that fits in the box
fn fit_within(src_w: u32, src_h: u32, box_w: u32, box_h: u32) -> (u32, u32) {
    let scale = f64::min(
        box_w as f64 / src_w.max(1) as f64,
        box_h as f64 / src_h.max(1) as f64,
    );
    (
        ((src_w as f64 * scale).round() as u32).max(1),
        ((src_h as f64 * scale).round() as u32).max(1),
    )
}

/// Scale to cover the box, then cut the window chosen by `crop`
fn crop_to_fill(
    img: &DynamicImage,
    target_w: u32,
    target_h: u32,
    crop: CropStrategy,
) -> Result<DynamicImage, TranscodeError> {
    let (src_w, src_h) = img.dimensions();
    let scale = f64::max(
        target_w as f64 / src_w.max(1) as f64,
        target_h as f64 / src_h.max(1) as f64,
    );
    let cover_w = ((src_w as f64 * scale).ceil() as u32).max(target_w);
    let cover_h = ((src_h as f64 * scale).ceil() as u32).max(target_h);
    let covered = resize_image(img, cover_w, cover_h)?;

    let (x, y) = if cover_w > target_w {
        (choose_offset(&covered, cover_w - target_w, target_w, true, crop), 0)
    } else {
        (0, choose_offset(&covered, cover_h - target_h, target_h, false, crop))
    };

    Ok(covered.crop_imm(x, y, target_w, target_h))
}

/// Offset along one axis for a window of `window` pixels with `slack` to spare
fn choose_offset(
    img: &DynamicImage,
    slack: u32,
    window: u32,
    horizontal: bool,
    crop: CropStrategy,
) -> u32 {
    match crop {
        CropStrategy::Low => 0,
        CropStrategy::High => slack,
        CropStrategy::None | CropStrategy::Centre => slack / 2,
        CropStrategy::Entropy | CropStrategy::Attention => {
            let energy = line_energy(img, horizontal, crop == CropStrategy::Attention);
            best_window(&energy, window as usize).unwrap_or(slack / 2)
        }
    }
}

/// Per-column (horizontal) or per-row detail score.
/// Attention scores luminance edges, entropy scores deviation from the line mean.
fn line_energy(img: &DynamicImage, horizontal: bool, edges: bool) -> Vec<u64> {
    let luma = img.to_luma8();
    let (w, h) = luma.dimensions();
    let (lines, len) = if horizontal { (w, h) } else { (h, w) };
    let at = |line: u32, i: u32| -> i64 {
        if horizontal {
            luma.get_pixel(line, i)[0] as i64
        } else {
            luma.get_pixel(i, line)[0] as i64
        }
    };

    (0..lines)
        .map(|line| {
            if edges {
                (1..len)
                    .map(|i| (at(line, i) - at(line, i - 1)).unsigned_abs())
                    .sum::<u64>()
            } else {
                let mean = (0..len).map(|i| at(line, i)).sum::<i64>() / len.max(1) as i64;
                (0..len).map(|i| (at(line, i) - mean).unsigned_abs()).sum::<u64>()
            }
        })
        .collect()
}

/// Start index of the window with the highest summed energy
fn best_window(energy: &[u64], window: usize) -> Option<u32> {
    if window == 0 || window > energy.len() {
        return None;
    }
    let mut sum: u64 = energy[..window].iter().sum();
    let mut best = (sum, 0usize);
    for start in 1..=energy.len() - window {
        sum = sum - energy[start - 1] + energy[start + window - 1];
        if sum > best.0 {
            best = (sum, start);
        }
    }
    Some(best.1 as u32)
}

/// Refuse a resize target before anything is allocated for it
fn check_resize_bounds(width: u32, height: u32) -> Result<(), TranscodeError> {
    let too_wide = width > MAX_RESIZE_DIMENSION || height > MAX_RESIZE_DIMENSION;
    if too_wide || width as u64 * height as u64 > MAX_RESIZE_PIXELS {
        return Err(TranscodeError::DimensionsTooLarge {
            format: "resize".to_string(),
            width,
            height,
            max: MAX_RESIZE_DIMENSION,
        });
    }
    Ok(())
}

/// Resize image using fast-image-resize with Lanczos3 filter
fn resize_image(
    img: &DynamicImage,
    target_w: u32,
    target_h: u32,
) -> Result<DynamicImage, TranscodeError> {
    let (src_w, src_h) = img.dimensions();
    if (src_w, src_h) == (target_w, target_h) {
        return Ok(img.clone());
    }
    check_resize_bounds(target_w, target_h)?;

    let src_width =
        NonZeroU32::new(src_w).ok_or_else(|| TranscodeError::resize_failed("Source width is 0"))?;
    let src_height = NonZeroU32::new(src_h)
        .ok_or_else(|| TranscodeError::resize_failed("Source height is 0"))?;
    let dst_width = NonZeroU32::new(target_w)
        .ok_or_else(|| TranscodeError::resize_failed("Target width is 0"))?;
    let dst_height = NonZeroU32::new(target_h)
        .ok_or_else(|| TranscodeError::resize_failed("Target height is 0"))?;

    let src_image = Image::from_vec_u8(
        src_width,
        src_height,
        img.to_rgba8().into_raw(),
        PixelType::U8x4,
    )
    .map_err(|e| TranscodeError::resize_failed(format!("Failed to create source image: {:?}", e)))?;

    let mut dst_image = Image::new(dst_width, dst_height, PixelType::U8x4);
    let mut resizer = Resizer::new(ResizeAlg::Convolution(FilterType::Lanczos3));

    resizer
        .resize(&src_image.view(), &mut dst_image.view_mut())
        .map_err(|e| TranscodeError::resize_failed(format!("Resize operation failed: {:?}", e)))?;

    let rgba_image = image::RgbaImage::from_raw(target_w, target_h, dst_image.into_vec())
        .ok_or_else(|| TranscodeError::resize_failed("Failed to create output image buffer"))?;

    Ok(DynamicImage::ImageRgba8(rgba_image))
}

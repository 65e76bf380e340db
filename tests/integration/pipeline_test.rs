// End-to-end conversions with the real image pipeline

use super::test_harness::{request, TestEnv};
use image::{DynamicImage, ImageFormat, RgbImage};
use picshift::transcoder::{ImagePipeline, OutputFormat};
use std::io::Cursor;
use std::sync::Arc;

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 4) as u8, (y * 4) as u8, ((x + y) * 2) as u8])
    });
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

#[tokio::test]
async fn test_png_to_webp() {
    let env = TestEnv::new(|_| {});
    env.write_source("gradient.png", &png(64, 32));
    let service = env.service(Arc::new(ImagePipeline::default()));

    let response = service
        .convert(&request("/gradient.png", "image/webp"))
        .await
        .unwrap();

    assert_eq!(response.served_format, OutputFormat::WebP);
    assert_eq!(&response.body[..4], b"RIFF");
    assert_eq!(&response.body[8..12], b"WEBP");
}

#[tokio::test]
async fn test_png_to_avif() {
    let env = TestEnv::new(|_| {});
    env.write_source("gradient.png", &png(32, 32));
    let service = env.service(Arc::new(ImagePipeline::default()));

    let response = service
        .convert(&request("/gradient.png", "image/avif"))
        .await
        .unwrap();

    assert_eq!(response.served_format, OutputFormat::Avif);
    assert_eq!(&response.body[4..8], b"ftyp");
}

#[tokio::test]
async fn test_resize_with_extra_params() {
    let env = TestEnv::new(|c| c.enable_extra_params = true);
    env.write_source("gradient.png", &png(64, 32));
    let service = env.service(Arc::new(ImagePipeline::default()));

    let mut req = request("/gradient.png", "image/webp");
    req.query.insert("width".to_string(), "32".to_string());
    let response = service.convert(&req).await.unwrap();

    let decoded = image::load_from_memory_with_format(&response.body, ImageFormat::WebP).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (32, 16));
    assert!(env
        .exhaust("webp/local/gradient.png._w32_h0_mw0_mh0.webp")
        .is_file());
}

#[tokio::test]
async fn test_undecodable_source_is_server_error() {
    let env = TestEnv::new(|_| {});
    env.write_source("broken.jpg", b"definitely not a jpeg");
    let service = env.service(Arc::new(ImagePipeline::default()));

    let err = service
        .convert(&request("/broken.jpg", "image/webp"))
        .await
        .unwrap_err();

    assert_eq!(err.to_http_status(), 500);
    assert!(!env.exhaust("webp/local/broken.jpg.webp").exists());
}

#[tokio::test]
async fn test_oversized_resize_serves_source() {
    let env = TestEnv::new(|c| c.enable_extra_params = true);
    let source = png(64, 32);
    env.write_source("gradient.png", &source);
    let service = env.service(Arc::new(ImagePipeline::default()));

    let mut req = request("/gradient.png", "image/webp");
    req.query.insert("width".to_string(), "60000".to_string());
    req.query.insert("height".to_string(), "60000".to_string());
    let response = service.convert(&req).await.unwrap();

    assert_eq!(response.served_format, OutputFormat::Original);
    assert_eq!(response.content_type, "image/png");
    assert_eq!(&response.body[..], &source[..]);
    assert!(!env.config.exhaust_path.join("webp").exists());
}

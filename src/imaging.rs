//! Image decoding, box overlays and encoding.

use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::io::Cursor;

use crate::error::PipelineError;
use crate::models::BoundingBox;

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_STROKE: u32 = 3;

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, PipelineError> {
    image::load_from_memory(bytes).map_err(|e| PipelineError::Decode(e.to_string()))
}

/// File extension matching the sniffed format of `bytes`, `png` when unknown.
pub fn extension_for(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("png")
}

/// Draws every box onto an RGB copy of `image`.
pub fn annotate(image: &DynamicImage, boxes: &[BoundingBox]) -> RgbImage {
    let mut canvas = image.to_rgb8();
    let (width, height) = canvas.dimensions();

    for b in boxes {
        for inset in 0..BOX_STROKE {
            let x1 = b.x1.round() as i32 + inset as i32;
            let y1 = b.y1.round() as i32 + inset as i32;
            let x2 = b.x2.round() as i32 - inset as i32;
            let y2 = b.y2.round() as i32 - inset as i32;
            if x2 <= x1 || y2 <= y1 {
                break;
            }
            let rect = Rect::at(x1, y1).of_size((x2 - x1) as u32, (y2 - y1) as u32);
            draw_hollow_rect_mut(&mut canvas, rect, BOX_COLOR);
        }
    }

    tracing::debug!(width, height, boxes = boxes.len(), "annotated image");
    canvas
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, PipelineError> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageOutputFormat::Png)
        .map_err(|e| PipelineError::Storage(format!("could not encode annotated image: {}", e)))?;
    Ok(buf.into_inner())
}

/// Decodes `bytes`, draws `boxes` and re-encodes the result as PNG.
pub fn annotate_bytes(bytes: &[u8], boxes: &[BoundingBox]) -> Result<Vec<u8>, PipelineError> {
    let image = decode(bytes)?;
    encode_png(&annotate(&image, boxes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn black_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::new(width, height);
        encode_png(&img).unwrap()
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = decode(b"definitely not an image").unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[test]
    fn extension_follows_sniffed_format() {
        assert_eq!(extension_for(&black_png(4, 4)), "png");
        assert_eq!(extension_for(b"????"), "png");
    }

    #[test]
    fn boxes_are_drawn_in_red() {
        let bytes = black_png(64, 64);
        let out = annotate_bytes(&bytes, &[BoundingBox::new(10.0, 10.0, 40.0, 50.0)]).unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), image::ImageFormat::Png);

        let img = decode(&out).unwrap().to_rgb8();
        assert_eq!(img.get_pixel(10, 20), &BOX_COLOR);
        assert_eq!(img.get_pixel(12, 20), &BOX_COLOR);
        assert_eq!(img.get_pixel(25, 30), &Rgb([0, 0, 0]));
    }

    #[test]
    fn boxes_outside_the_image_are_clipped() {
        let bytes = black_png(16, 16);
        let out = annotate_bytes(&bytes, &[BoundingBox::new(-5.0, -5.0, 100.0, 100.0)]).unwrap();
        let img = decode(&out).unwrap();
        assert_eq!((img.width(), img.height()), (16, 16));
    }
}

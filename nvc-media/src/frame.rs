//! Decoded frame images

use crate::error::MediaError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use image::{ImageFormat, RgbImage};
use nvc_core::Tensor;
use std::io::Cursor;

const DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// An RGB8 frame produced by the decoder
///
/// Pixel storage is shared, so clones handed to several subscribers are cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    width: u32,
    height: u32,
    pixels: Bytes,
}

impl DecodedFrame {
    /// Wrap raw RGB8 pixels
    pub fn from_rgb8(width: u32, height: u32, pixels: impl Into<Bytes>) -> Result<Self, MediaError> {
        let pixels = pixels.into();
        if pixels.len() != width as usize * height as usize * 3 {
            return Err(MediaError::InvalidFrameData {
                expected: format!("{}x{} RGB8 pixels", width, height),
                actual: vec![pixels.len()],
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Convert an `[H, W, C]` tensor with values in `[0, 1]`
    ///
    /// One channel is expanded to grey, a fourth (alpha) channel is dropped.
    pub fn from_hwc(tensor: &Tensor) -> Result<Self, MediaError> {
        let (height, width, channels) = match tensor.shape() {
            [h, w, c] => (*h, *w, *c),
            shape => {
                return Err(MediaError::InvalidFrameData {
                    expected: "[height, width, channels]".to_string(),
                    actual: shape.to_vec(),
                })
            }
        };
        if !matches!(channels, 1 | 3 | 4) {
            return Err(MediaError::UnsupportedChannels { channels });
        }

        let to_byte = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        let mut pixels = Vec::with_capacity(height * width * 3);
        for pixel in tensor.data().chunks_exact(channels) {
            match channels {
                1 => pixels.extend_from_slice(&[to_byte(pixel[0]); 3]),
                _ => pixels.extend(pixel[..3].iter().map(|v| to_byte(*v))),
            }
        }

        Self::from_rgb8(width as u32, height as u32, pixels)
    }

    /// Decode a PNG given as a data URL or bare base64
    pub fn from_encoded(encoded: &str) -> Result<Self, MediaError> {
        let body = encoded
            .split_once(";base64,")
            .map(|(_, body)| body)
            .unwrap_or(encoded);
        let png = STANDARD
            .decode(body.trim())
            .map_err(|e| MediaError::ImageEncoding {
                reason: e.to_string(),
            })?;
        let image = image::load_from_memory_with_format(&png, ImageFormat::Png)
            .map_err(|e| MediaError::ImageEncoding {
                reason: e.to_string(),
            })?
            .to_rgb8();
        let (width, height) = image.dimensions();
        Self::from_rgb8(width, height, image.into_raw())
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGB8 pixels, row major
    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }

    /// RGB value at `(x, y)`
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        Some([
            self.pixels[offset],
            self.pixels[offset + 1],
            self.pixels[offset + 2],
        ])
    }

    /// Encode as PNG
    pub fn to_png(&self) -> Result<Vec<u8>, MediaError> {
        let image = RgbImage::from_raw(self.width, self.height, self.pixels.to_vec()).ok_or_else(
            || MediaError::ImageEncoding {
                reason: "pixel buffer does not match dimensions".to_string(),
            },
        )?;
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| MediaError::ImageEncoding {
                reason: e.to_string(),
            })?;
        Ok(png)
    }

    /// Encode as a `data:image/png;base64,...` URL
    pub fn to_data_url(&self) -> Result<String, MediaError> {
        Ok(format!("{}{}", DATA_URL_PREFIX, STANDARD.encode(self.to_png()?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvc_core::TensorRegistry;

    #[test]
    fn test_from_hwc() {
        let registry = TensorRegistry::new();
        let tensor = registry
            .tensor(vec![1, 2, 3], vec![1.0, 0.0, 0.0, 0.0, 0.5, 1.0])
            .unwrap();
        let frame = DecodedFrame::from_hwc(&tensor).unwrap();
        assert_eq!((frame.width(), frame.height()), (2, 1));
        assert_eq!(frame.pixel(0, 0), Some([255, 0, 0]));
        assert_eq!(frame.pixel(1, 0), Some([0, 128, 255]));
        assert_eq!(frame.pixel(2, 0), None);
    }

    #[test]
    fn test_grey_and_alpha() {
        let registry = TensorRegistry::new();
        let grey = registry.tensor(vec![1, 1, 1], vec![0.2]).unwrap();
        assert_eq!(
            DecodedFrame::from_hwc(&grey).unwrap().pixel(0, 0),
            Some([51, 51, 51])
        );

        let rgba = registry
            .tensor(vec![1, 1, 4], vec![0.0, 1.0, 0.0, 0.5])
            .unwrap();
        assert_eq!(
            DecodedFrame::from_hwc(&rgba).unwrap().pixel(0, 0),
            Some([0, 255, 0])
        );

        let two = registry.zeros(vec![1, 1, 2]);
        assert_eq!(
            DecodedFrame::from_hwc(&two),
            Err(MediaError::UnsupportedChannels { channels: 2 })
        );
        assert!(DecodedFrame::from_hwc(&registry.zeros(vec![3, 3])).is_err());
    }

    #[test]
    fn test_png_data_url() {
        let frame = DecodedFrame::from_rgb8(2, 2, vec![10u8; 12]).unwrap();
        let png = frame.to_png().unwrap();
        assert_eq!(&png[1..4], b"PNG");

        let url = frame.to_data_url().unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
        assert_eq!(DecodedFrame::from_encoded(&url).unwrap(), frame);
    }

    #[test]
    fn test_rejects_bad_buffers() {
        assert!(DecodedFrame::from_rgb8(2, 2, vec![0u8; 5]).is_err());
        assert!(DecodedFrame::from_encoded("not base64!").is_err());
    }
}

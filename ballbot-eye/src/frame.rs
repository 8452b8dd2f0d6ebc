//! Decoded video frames

use crate::detection::BBox;
use crate::error::BotError;
use bytes::Bytes;
use std::time::Instant;

/// Decoded RGB8 image, immutable once published
#[derive(Debug, Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Bytes,
    captured_at: Instant,
}

impl Frame {
    /// Wrap tightly packed RGB8 pixels
    pub fn new(width: u32, height: u32, pixels: impl Into<Bytes>) -> Result<Self, BotError> {
        let pixels = pixels.into();
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|p| p.checked_mul(3))
            .ok_or_else(|| BotError::Decode("Frame dimensions overflow".to_string()))?;
        if pixels.len() != expected {
            return Err(BotError::Decode(format!(
                "Frame buffer holds {} bytes, expected {} for {}x{}",
                pixels.len(),
                expected,
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
            captured_at: Instant::now(),
        })
    }

    /// Decode a JPEG (or any format the `image` crate understands)
    pub fn decode(encoded: &[u8]) -> Result<Self, BotError> {
        let image = image::load_from_memory(encoded)?;
        let rgb = image.into_rgb8();
        let (width, height) = rgb.dimensions();
        Self::new(width, height, rgb.into_raw())
    }

    /// Solid color frame, mostly useful for tests and warm-up
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..(width as usize * height as usize) {
            pixels.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            pixels: Bytes::from(pixels),
            captured_at: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Integer pixel rectangle covered by `bbox`, clipped to the frame
    pub fn clip_rect(&self, bbox: &BBox) -> Option<(u32, u32, u32, u32)> {
        let clamped = bbox.clamp_to(self.width as f32, self.height as f32);
        let x0 = clamped.x.floor().max(0.0) as u32;
        let y0 = clamped.y.floor().max(0.0) as u32;
        let x1 = ((clamped.x + clamped.w).ceil() as u32).min(self.width);
        let y1 = ((clamped.y + clamped.h).ceil() as u32).min(self.height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }

    /// Copy the pixels under `bbox` into a new frame
    pub fn crop(&self, bbox: &BBox) -> Option<Frame> {
        let (x, y, w, h) = self.clip_rect(bbox)?;
        let stride = self.width as usize * 3;
        let mut pixels = Vec::with_capacity(w as usize * h as usize * 3);
        for row in y..y + h {
            let start = row as usize * stride + x as usize * 3;
            pixels.extend_from_slice(&self.pixels[start..start + w as usize * 3]);
        }
        Some(Frame {
            width: w,
            height: h,
            pixels: Bytes::from(pixels),
            captured_at: self.captured_at,
        })
    }

    /// Paint a filled disc, used to build synthetic scenes
    pub fn with_disc(&self, center: (f32, f32), radius: f32, rgb: [u8; 3]) -> Frame {
        let mut pixels = self.pixels.to_vec();
        let r2 = radius * radius;
        for y in 0..self.height {
            for x in 0..self.width {
                let dx = x as f32 + 0.5 - center.0;
                let dy = y as f32 + 0.5 - center.1;
                if dx * dx + dy * dy <= r2 {
                    let idx = (y as usize * self.width as usize + x as usize) * 3;
                    pixels[idx..idx + 3].copy_from_slice(&rgb);
                }
            }
        }
        Frame {
            width: self.width,
            height: self.height,
            pixels: Bytes::from(pixels),
            captured_at: self.captured_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_new_rejects_short_buffer() {
        assert!(Frame::new(4, 4, vec![0u8; 10]).is_err());
        assert!(Frame::new(4, 4, vec![0u8; 48]).is_ok());
    }

    #[test]
    fn test_frame_decode_garbage() {
        assert!(Frame::decode(b"definitely not a jpeg").is_err());
    }

    #[test]
    fn test_frame_crop_clips_to_bounds() {
        let frame = Frame::filled(10, 8, [1, 2, 3]);
        let crop = frame.crop(&BBox::new(-5.0, 6.0, 8.0, 10.0)).unwrap();
        assert_eq!(crop.width(), 3);
        assert_eq!(crop.height(), 2);
        assert_eq!(&crop.pixels()[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_frame_crop_outside_is_none() {
        let frame = Frame::filled(10, 8, [0, 0, 0]);
        assert!(frame.crop(&BBox::new(20.0, 20.0, 5.0, 5.0)).is_none());
    }

    #[test]
    fn test_with_disc_paints_center() {
        let frame = Frame::filled(20, 20, [0, 0, 0]).with_disc((10.0, 10.0), 3.0, [255, 0, 0]);
        let idx = (10 * 20 + 10) * 3;
        assert_eq!(&frame.pixels()[idx..idx + 3], &[255, 0, 0]);
        assert_eq!(&frame.pixels()[..3], &[0, 0, 0]);
    }
}

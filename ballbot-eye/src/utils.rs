//! OpenCV conversion helpers

use crate::error::BotError;
use crate::frame::Frame;
use opencv::core::{Mat, Scalar, CV_8UC3};
use opencv::imgproc;
use opencv::prelude::*;

/// Gains within this distance of 1.0 are treated as identity
const GAIN_EPSILON: f32 = 1e-3;

/// Copy an RGB8 frame into a 3-channel OpenCV matrix
pub fn frame_to_mat(frame: &Frame) -> Result<Mat, BotError> {
    if frame.is_empty() {
        return Err(BotError::Processing("Cannot convert an empty frame".to_string()));
    }

    let rows = i32::try_from(frame.height())
        .map_err(|_| BotError::Processing("Frame height exceeds i32".to_string()))?;
    let cols = i32::try_from(frame.width())
        .map_err(|_| BotError::Processing("Frame width exceeds i32".to_string()))?;

    let mut mat = Mat::new_rows_cols_with_default(rows, cols, CV_8UC3, Scalar::all(0.0))?;
    let data = mat.data_bytes_mut()?;
    if data.len() != frame.pixels().len() {
        return Err(BotError::Processing(format!(
            "Matrix holds {} bytes, frame has {}",
            data.len(),
            frame.pixels().len()
        )));
    }
    data.copy_from_slice(frame.pixels());
    Ok(mat)
}

/// Convert a frame to HSV and scale its saturation and value channels.
///
/// Hue keeps the OpenCV 8-bit range 0..179; S and V saturate at 255.
pub fn frame_to_hsv(frame: &Frame, saturation_gain: f32, value_gain: f32) -> Result<Mat, BotError> {
    let rgb = frame_to_mat(frame)?;
    let mut hsv = Mat::default();
    imgproc::cvt_color(&rgb, &mut hsv, imgproc::COLOR_RGB2HSV, 0)?;
    apply_gains(&mut hsv, saturation_gain, value_gain)?;
    Ok(hsv)
}

fn apply_gains(hsv: &mut Mat, saturation_gain: f32, value_gain: f32) -> Result<(), BotError> {
    let s_identity = (saturation_gain - 1.0).abs() < GAIN_EPSILON;
    let v_identity = (value_gain - 1.0).abs() < GAIN_EPSILON;
    if s_identity && v_identity {
        return Ok(());
    }

    for px in hsv.data_bytes_mut()?.chunks_exact_mut(3) {
        px[1] = scale_channel(px[1], saturation_gain);
        px[2] = scale_channel(px[2], value_gain);
    }
    Ok(())
}

/// Multiply an 8-bit channel value, saturating to 0..=255
pub fn scale_channel(value: u8, gain: f32) -> u8 {
    let scaled = value as f32 * gain;
    if !scaled.is_finite() {
        return 0;
    }
    scaled.round().clamp(0.0, 255.0) as u8
}

/// HSV triples of every pixel in `frame`, after applying the gains
pub fn hsv_pixels(frame: &Frame, saturation_gain: f32, value_gain: f32) -> Result<Vec<[u8; 3]>, BotError> {
    let hsv = frame_to_hsv(frame, saturation_gain, value_gain)?;
    let data = hsv.data_bytes()?;
    Ok(data
        .chunks_exact(3)
        .map(|px| [px[0], px[1], px[2]])
        .collect())
}

/// Value at percentile `p` (0..=100) using linear interpolation between ranks
pub fn percentile(sorted: &[f32], p: f32) -> Option<f32> {
    if sorted.is_empty() || !p.is_finite() {
        return None;
    }
    let p = p.clamp(0.0, 100.0);
    let rank = p / 100.0 * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f32;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

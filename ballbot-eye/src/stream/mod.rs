//! Continuous MJPEG stream ingestion
//!
//! The ingestion task keeps exactly one decoded frame: the newest. Frames the
//! control loop never reads are discarded once superseded.

pub mod multipart;
pub mod source;

pub use multipart::MultipartParser;
pub use source::{FrameSlot, StreamSource, StreamStats};

//! Run the color detector and controller on a single image file
//!
//! cargo run --example still_frame -- path/to/frame.jpg

use ballbot_eye::config::{ControlConfig, FusionConfig};
use ballbot_eye::detection::RawDetection;
use ballbot_eye::frame::Frame;
use ballbot_eye::processing::{ColorDetector, ColorProfile};
use ballbot_eye::MotionController;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: still_frame <image>"))?;
    let frame = Frame::decode(&std::fs::read(&path)?)?;
    println!("{}: {}x{}", path, frame.width(), frame.height());

    let detector = ColorDetector::new(FusionConfig::default());
    let outcome = detector.detect(&frame, &ColorProfile::default(), None)?;
    println!("{} candidate(s)", outcome.candidates);

    let detection = outcome.best_accepted.clone().map(RawDetection::Circle);
    if let Some(RawDetection::Circle(circle)) = &detection {
        println!(
            "ball at ({:.0}, {:.0}) r={:.1} circularity={:.2}",
            circle.center.0, circle.center.1, circle.radius, circle.circularity
        );
    }

    let mut controller = MotionController::new(ControlConfig::default());
    let command = controller.decide(detection.as_ref(), frame.width());
    println!("{} -> {}", controller.state(), command);
    Ok(())
}

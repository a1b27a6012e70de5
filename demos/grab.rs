//! Grab one depth and one video frame with the blocking facade.
//!
//! Usage: cargo run --example grab [device-index]

use kinect::Grabber;
use std::time::Duration;

fn main() {
    env_logger::init();

    let index: usize = std::env::args()
        .nth(1)
        .and_then(|a| a.parse().ok())
        .unwrap_or(0);

    let mut grabber = match Grabber::new() {
        Ok(g) => g,
        Err(e) => {
            eprintln!("Failed to initialise: {}", e);
            std::process::exit(1);
        }
    };

    match grabber.depth(index, Duration::from_secs(3)) {
        Ok(frame) => {
            let center = frame.sample_u16(frame.width() / 2, frame.height() / 2);
            println!(
                "depth: {}x{} {} bits seq={} ts={} center={:?}",
                frame.width(),
                frame.height(),
                frame.bits_per_pixel(),
                frame.sequence,
                frame.timestamp,
                center
            );
        }
        Err(e) => {
            eprintln!("Depth grab failed: {}", e);
            std::process::exit(1);
        }
    }

    match grabber.video(index, Duration::from_secs(3)) {
        Ok(frame) => {
            let mean = frame.payload().iter().map(|&b| b as u64).sum::<u64>()
                / frame.payload().len().max(1) as u64;
            println!(
                "video: {}x{} {:?} seq={} mean={}",
                frame.width(),
                frame.height(),
                frame.mode.format,
                frame.sequence,
                mean
            );
        }
        Err(e) => {
            eprintln!("Video grab failed: {}", e);
            std::process::exit(1);
        }
    }

    grabber.stop();
}

//! Stream depth frames through a callback on the background event thread.
//!
//! Usage: cargo run --example stream [seconds]

use kinect::{Context, DepthFormat, Resolution};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    env_logger::init();

    let seconds: u64 = std::env::args()
        .nth(1)
        .and_then(|a| a.parse().ok())
        .unwrap_or(10);

    let ctx = match Context::init() {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Failed to initialise: {}", e);
            std::process::exit(1);
        }
    };
    let device = match ctx.open(0) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Failed to open device: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = device.set_depth_format(Resolution::Medium, DepthFormat::Bit11) {
        eprintln!("Failed to set format: {}", e);
        std::process::exit(1);
    }

    let count = Arc::new(AtomicU64::new(0));
    let counter = count.clone();
    device.set_depth_callback(move |_, frame| {
        let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
        // Print every ~30th frame to avoid flooding the terminal
        if n % 30 == 1 {
            println!(
                "seq={:<6} ts={:<10} center={:?}",
                frame.sequence,
                frame.timestamp,
                frame.sample_u16(frame.width() / 2, frame.height() / 2)
            );
        }
    });

    if let Err(e) = device.start_depth().and_then(|_| ctx.start_event_thread()) {
        eprintln!("Failed to start streaming: {}", e);
        std::process::exit(1);
    }

    println!("Streaming depth for {}s...", seconds);
    let start = Instant::now();
    std::thread::sleep(Duration::from_secs(seconds));

    let elapsed = start.elapsed().as_secs_f64();
    let total = count.load(Ordering::Relaxed);
    println!(
        "\nTotal: {} frames in {:.1}s ({:.1} fps), {} dropped",
        total,
        elapsed,
        total as f64 / elapsed,
        device.dropped_frames(kinect::StreamKind::Depth)
    );

    if let Err(e) = ctx.shutdown() {
        eprintln!("Shutdown failed: {}", e);
    }
}

//! Tilt the sensor head, cycle the LED and print accelerometer readings.
//!
//! Usage: cargo run --example tilt [degrees]

use kinect::{Context, LedMode};
use std::time::Duration;

fn main() {
    env_logger::init();

    let degrees: f64 = std::env::args()
        .nth(1)
        .and_then(|a| a.parse().ok())
        .unwrap_or(0.0);

    let result = Context::init().and_then(|ctx| {
        let device = ctx.open(0)?;
        device.set_led(LedMode::BlinkGreen)?;
        device.set_tilt_degrees(degrees)?;

        for _ in 0..10 {
            let state = device.tilt_state()?;
            let [x, y, z] = state.mks_accel();
            println!(
                "angle={:>6}  status={:?}  accel=[{:+.2}, {:+.2}, {:+.2}] m/s²",
                state
                    .degrees()
                    .map(|d| format!("{:+.1}", d))
                    .unwrap_or_else(|| "?".into()),
                state.status,
                x,
                y,
                z
            );
            std::thread::sleep(Duration::from_millis(300));
        }

        device.set_led(LedMode::Green)?;
        ctx.shutdown()
    });

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

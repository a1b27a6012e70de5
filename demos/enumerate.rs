//! List all connected Kinect-class devices.

fn main() {
    env_logger::init();

    let ctx = match kinect::Context::init() {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match ctx.enumerate() {
        Ok(devices) => {
            println!("Found {} device(s):", devices.len());
            for dev in &devices {
                println!(
                    "  [{}] Serial={}  Bus={} Addr={}",
                    dev.index,
                    dev.serial.as_deref().unwrap_or("?"),
                    dev.bus,
                    dev.address
                );
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

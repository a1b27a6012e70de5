//! Print details and supported modes of the first connected device.

fn main() {
    env_logger::init();

    let result = kinect::Context::init().and_then(|ctx| {
        let device = ctx.open(0)?;
        println!("Serial:      {}", device.serial().unwrap_or("?"));
        println!("Subdevices:  {:?}", device.subdevices());
        println!("Depth mode:  {:?}", device.mode(kinect::StreamKind::Depth));
        println!("Video mode:  {:?}", device.mode(kinect::StreamKind::Video));
        println!();
        println!("Supported modes:");
        for mode in kinect::depth_modes().iter().chain(kinect::video_modes()) {
            println!(
                "  {:<6?} {:<28?} {}x{}  {} bits  {} fps",
                mode.resolution,
                mode.format,
                mode.width,
                mode.height,
                mode.data_bits_per_pixel,
                mode.framerate
            );
        }
        ctx.shutdown()
    });

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

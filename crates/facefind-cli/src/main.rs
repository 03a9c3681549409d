mod capture;
mod config;
mod display;
mod session;

use anyhow::{Context, Result};
use config::Config;
use display::HighguiSurface;
use facefind_core::OnnxMatcher;
use facefind_hw::{open_first, Camera};
use session::{ExitReason, Session};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();
    tracing::debug!(?config, "configuration loaded");

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&interrupted);
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
            .context("failed to install Ctrl-C handler")?;
    }

    println!("Initializing webcam...");
    let (index, camera) = match open_first(&config.camera_indices, Camera::open_index) {
        Ok(opened) => opened,
        Err(e) => {
            tracing::error!(error = %e, "no usable camera");
            report_no_camera();
            return Ok(());
        }
    };
    println!("Successfully opened camera at index {index}");
    tracing::info!(
        index,
        device = %camera.device_path,
        width = camera.width,
        height = camera.height,
        "capturing"
    );

    let matcher = OnnxMatcher::new(config.model_dir.clone());
    let mut session = Session::new(camera, HighguiSurface::new(), matcher, config);
    let result = session.run(&interrupted);
    tracing::debug!(state = ?session.state(), "session finished");
    // Releases the camera and any windows still open.
    drop(session);

    if let Ok(ExitReason::Interrupted) = result {
        println!("\nProgram interrupted by user.");
    }
    println!("Program ended.");

    result.map(|_| ())
}

fn report_no_camera() {
    eprintln!("Error: Could not open any webcam. Please check your camera connection.");
    eprintln!("Troubleshooting tips:");
    eprintln!("1. Make sure the camera is properly connected");
    eprintln!("2. Check if another application is using the camera");
    eprintln!("3. Try a different USB port if using an external camera");

    let devices = Camera::list_devices();
    if devices.is_empty() {
        eprintln!("\nNo V4L2 capture devices found.");
        return;
    }
    eprintln!("\nAvailable capture devices:");
    for dev in devices {
        eprintln!("  {} : {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
    }
}

//! v4l2-camera-hal binary for exercising a capture device.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use v4l2_camera_hal::{
    CameraConfig, CameraError, CameraHardware, Cookie, JpegCallback, PreviewCallback,
    ShutterCallback, V4L2Backend,
};

#[derive(Parser)]
#[command(name = "v4l2-camera-hal")]
#[command(about = "Preview, snapshot and inspect a V4L2 webcam")]
#[command(version)]
struct Cli {
    /// Capture device node (overrides CAMERA_DEVICE)
    #[arg(short, long, global = true)]
    device: Option<PathBuf>,

    /// Per-frame grab budget in milliseconds, 0 waits forever
    #[arg(long, global = true)]
    grab_timeout_ms: Option<u64>,

    /// Log measured FPS every 32 frames
    #[arg(long, global = true)]
    show_fps: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run preview for a number of frames and report the frame rate
    Preview {
        /// Frames to receive before stopping
        #[arg(short, long, default_value = "100")]
        frames: u32,
    },

    /// Take a still picture and write it as JPEG
    Snapshot {
        /// Output file path
        #[arg(short, long, default_value = "snapshot.jpg")]
        output: PathBuf,
    },

    /// Print the default parameter set
    Params,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> v4l2_camera_hal::Result<()> {
    let mut config = CameraConfig::from_env();
    if let Some(device) = cli.device {
        config.device_path = device;
    }
    if let Some(ms) = cli.grab_timeout_ms {
        config.grab_timeout = (ms > 0).then(|| Duration::from_millis(ms));
    }
    config.show_fps |= cli.show_fps;

    match cli.command {
        Commands::Preview { frames } => preview(config, frames),
        Commands::Snapshot { output } => snapshot(config, &output),
        Commands::Params => {
            for (key, value) in config.default_parameters().iter() {
                println!("{key}={value}");
            }
            Ok(())
        }
    }
}

fn preview(config: CameraConfig, frames: u32) -> v4l2_camera_hal::Result<()> {
    let hardware = CameraHardware::new(V4L2Backend, config);
    let (tx, rx) = mpsc::channel::<usize>();
    let callback: Arc<PreviewCallback> = Arc::new(move |buf: &[u8], _: &Cookie| {
        let _ = tx.send(buf.len());
    });

    hardware.start_preview(callback, Cookie::none())?;
    println!("Device: {}", hardware.config().device_path.display());

    let started = Instant::now();
    let mut received = 0u32;
    while received < frames {
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(len) => {
                received += 1;
                if received == 1 {
                    println!("First frame: {len} bytes");
                }
            }
            Err(_) => break,
        }
    }
    hardware.stop_preview();

    if received < frames {
        return Err(CameraError::Timeout);
    }
    let elapsed = started.elapsed().as_secs_f64();
    println!(
        "{received} frames in {elapsed:.2}s ({:.1} fps)",
        f64::from(received) / elapsed
    );
    Ok(())
}

fn snapshot(config: CameraConfig, output: &Path) -> v4l2_camera_hal::Result<()> {
    let hardware = CameraHardware::new(V4L2Backend, config);

    let shutter: Arc<ShutterCallback> = Arc::new(|_: &Cookie| println!("Shutter"));
    let encoded = Arc::new(Mutex::new(None::<Vec<u8>>));
    let sink = Arc::clone(&encoded);
    let jpeg: Arc<JpegCallback> = Arc::new(move |bytes: &[u8], _: &Cookie| {
        if let Ok(mut slot) = sink.lock() {
            *slot = Some(bytes.to_vec());
        }
    });

    hardware.take_picture(Some(shutter), None, Some(jpeg), Cookie::none())?;

    let bytes = encoded
        .lock()
        .ok()
        .and_then(|mut slot| slot.take())
        .ok_or_else(|| CameraError::Encoding("no JPEG delivered".to_owned()))?;
    let (width, height) = jpeg_dimensions(&bytes)?;
    std::fs::write(output, &bytes)?;
    println!(
        "Wrote {width}x{height} JPEG ({} bytes) to {}",
        bytes.len(),
        output.display()
    );
    Ok(())
}

/// Dimensions recorded in the JPEG header, i.e. the size the driver delivered.
fn jpeg_dimensions(bytes: &[u8]) -> v4l2_camera_hal::Result<(u32, u32)> {
    image::ImageReader::with_format(Cursor::new(bytes), image::ImageFormat::Jpeg)
        .into_dimensions()
        .map_err(|err| CameraError::Encoding(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use v4l2_camera_hal::convert::{yuyv_len, yuyv_to_jpeg};

    #[test]
    fn test_jpeg_dimensions_reports_encoded_size() {
        let raw = vec![128u8; yuyv_len(48, 32)];
        let jpeg = yuyv_to_jpeg(&raw, 48, 32, 90).expect("encode should succeed");
        assert_eq!(jpeg_dimensions(&jpeg).expect("header should parse"), (48, 32));
    }

    #[test]
    fn test_jpeg_dimensions_rejects_garbage() {
        assert!(matches!(
            jpeg_dimensions(&[0u8; 16]),
            Err(CameraError::Encoding(_))
        ));
    }
}

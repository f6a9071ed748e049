//! CLI entry point for dmabuf-capture.
//!
//! Captures frames from a V4L2 device into DMA-heap buffers and dumps each
//! one to `<out-dir>/image_<N>.raw`.
//!
//! # Usage
//!
//! ```bash
//! # 10 frames from /dev/video0 at the device's current format
//! dmabuf-capture
//!
//! # 1280x720 YUYV from /dev/video2, 30 frames, 1s timeout
//! dmabuf-capture -d /dev/video2 -w 1280 -h 720 -f YUYV -l 30 -t 1000
//!
//! # No hardware: simulated device, memfd buffers
//! dmabuf-capture --simulate --memfd -o ./frames
//! ```
//!
//! `-h` sets the height; use `--help` for usage.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use dmabuf_capture::config::{CaptureConfig, HeapSource};
use dmabuf_capture::device::{CaptureDevice, SimulatedDevice, V4l2Device};
use dmabuf_capture::format::FourCc;
use dmabuf_capture::memory::HeapAllocator;
use dmabuf_capture::memory::defaults::{
    DEFAULT_BUFFER_COUNT, DEFAULT_DEVICE, DEFAULT_FRAME_COUNT, DEFAULT_OUTPUT_DIR, DEFAULT_TIMEOUT,
};
use dmabuf_capture::observability::{init_tracing, instrument_session};
use dmabuf_capture::session::{CaptureSession, RunSummary};
use dmabuf_capture::sink::RawFrameSink;
use dmabuf_capture::Result;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "dmabuf-capture", version)]
#[command(about = "Capture V4L2 frames into DMA-heap buffers", long_about = None)]
#[command(disable_help_flag = true)]
struct Cli {
    /// Video device node
    #[arg(short = 'd', long, default_value = DEFAULT_DEVICE)]
    device: PathBuf,

    /// Desired image width (0 keeps the current width)
    #[arg(short = 'w', long, default_value_t = 0)]
    width: u32,

    /// Desired image height (0 keeps the current height)
    #[arg(short = 'h', long, default_value_t = 0)]
    height: u32,

    /// Desired image fourcc, e.g. YUYV
    #[arg(short = 'f', long)]
    fourcc: Option<FourCc>,

    /// Number of frames to capture
    #[arg(short = 'l', long = "loop-count", default_value_t = DEFAULT_FRAME_COUNT)]
    loop_count: u32,

    /// Timeout per frame in milliseconds
    #[arg(short = 't', long = "timeout", default_value_t = DEFAULT_TIMEOUT.as_millis() as u64)]
    timeout_ms: u64,

    /// Directory for frame dumps
    #[arg(short = 'o', long = "out-dir", default_value = DEFAULT_OUTPUT_DIR)]
    out_dir: PathBuf,

    /// Buffers in the capture ring
    #[arg(short = 'n', long = "buffers", default_value_t = DEFAULT_BUFFER_COUNT)]
    buffers: usize,

    /// Use the simulated capture device
    #[arg(long)]
    simulate: bool,

    /// Allocate buffers with memfd instead of a DMA heap
    #[arg(long)]
    memfd: bool,

    /// Print help
    #[arg(long, action = clap::ArgAction::Help)]
    #[allow(dead_code)]
    help: Option<bool>,
}

impl From<Cli> for CaptureConfig {
    fn from(cli: Cli) -> Self {
        Self {
            device: cli.device,
            width: cli.width,
            height: cli.height,
            fourcc: cli.fourcc.unwrap_or(FourCc::NONE),
            frames: cli.loop_count,
            timeout: Duration::from_millis(cli.timeout_ms),
            output_dir: cli.out_dir,
            buffer_count: cli.buffers,
            heap: if cli.memfd {
                HeapSource::Memfd
            } else {
                HeapSource::default_dma_heap()
            },
            simulate: cli.simulate,
        }
    }
}

fn main() -> ExitCode {
    init_tracing("dmabuf_capture=info");
    let config = CaptureConfig::from(Cli::parse());

    match run(&config) {
        Ok(summary) => {
            info!(frames = summary.frames, timed_out = summary.timed_out, "Capture finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Capture failed");
            ExitCode::FAILURE
        }
    }
}

fn run(config: &CaptureConfig) -> Result<RunSummary> {
    config.validate()?;
    let heap = config.heap.open()?;

    if config.simulate {
        capture(SimulatedDevice::new(), config, heap.as_ref())
    } else {
        capture(V4l2Device::open(&config.device)?, config, heap.as_ref())
    }
}

fn capture<D: CaptureDevice>(
    device: D,
    config: &CaptureConfig,
    heap: &dyn HeapAllocator,
) -> Result<RunSummary> {
    let device_name = if config.simulate {
        "simulated".to_string()
    } else {
        config.device.display().to_string()
    };
    let _span = instrument_session(&device_name);

    let mut session = CaptureSession::open(device)?;
    let format = session.negotiate(config.format_request())?;

    println!("Actual v4l2 device:  {device_name}");
    println!("Actual timeout:      {}ms", config.timeout.as_millis());
    println!("Actual image width:  {}", format.width);
    println!("Actual image height: {}", format.height);
    println!("Actual image format: {}", format.fourcc);
    println!("Actual image size:   {}", format.frame_size);

    session.allocate_and_register(heap, config.buffer_count)?;
    session.start()?;

    let mut sink = RawFrameSink::new(&config.output_dir)?;
    info!(dir = %sink.dir().display(), frames = config.frames, "Dumping frames");
    let mut dumped = 0u64;
    let summary = session.run(u64::from(config.frames), config.timeout, |frame, planes| {
        let n = dumped;
        dumped += 1;
        match sink.write_frame(n, planes) {
            Ok(path) => println!(
                "Dumping {} bytes with offset {} to {} ... OK",
                frame.payload_len(),
                frame.descriptor.planes[0].data_offset,
                path.display()
            ),
            // A failed dump does not end the run
            Err(e) => warn!(frame = n, error = %e, "Frame dump failed"),
        }
        Ok(())
    })?;

    if summary.timed_out {
        warn!(frames = summary.frames, "Timed out waiting for frames");
    }
    session.stop()?;
    Ok(summary)
}

//! Demo binary: decodes an Annex-B H.264 file through the stateless V4L2
//! pipeline, discarding every frame ("decode to null"). Exercises the same
//! path a real consumer (display, encoder) would drive.

use anyhow::{Context, Result};
use clap::Parser;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use v4l2_h264_stateless::buffers::{CodedPool, DecodedPool};
use v4l2_h264_stateless::config::Config;
use v4l2_h264_stateless::decode_loop::DecodeLoop;
use v4l2_h264_stateless::device::Device;
use v4l2_h264_stateless::request::RequestPool;
use v4l2_h264_stateless::sharing::LocalConsumer;

#[derive(Parser)]
#[command(name = "decode-to-null")]
#[command(about = "Decode an Annex-B H.264 file through the stateless V4L2 pipeline")]
struct Cli {
    /// Path to an Annex-B H.264 elementary stream.
    input: std::path::PathBuf,

    /// Picture width in pixels (the device may negotiate a different value).
    #[arg(long, default_value_t = 1920)]
    width: u32,

    /// Picture height in pixels (the device may negotiate a different value).
    #[arg(long, default_value_t = 1080)]
    height: u32,

    #[arg(long)]
    verbose: bool,
}

const DMA_HEAP_IOC_MAGIC: u8 = b'H';

#[repr(C)]
struct DmaHeapAllocationData {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}

fn dma_heap_ioctl_alloc() -> libc::c_ulong {
    // _IOWR('H', 0x0, struct dma_heap_allocation_data)
    let dir: u32 = 3;
    let size = std::mem::size_of::<DmaHeapAllocationData>() as u32;
    ((dir << 30) | ((DMA_HEAP_IOC_MAGIC as u32) << 8) | size << 16) as libc::c_ulong
}

/// Allocates `count` buffers of `size` bytes from the system DMA-BUF heap,
/// the same external-allocation step a display compositor would perform
/// before registering buffers with the decoded-output pool.
fn allocate_dmabufs(count: u32, size: u32) -> Result<Vec<RawFd>> {
    let heap = std::fs::OpenOptions::new()
        .read(true)
        .open("/dev/dma_heap/system")
        .context("opening /dev/dma_heap/system (requires a kernel with CONFIG_DMABUF_HEAPS)")?;
    let heap_fd = std::os::fd::AsRawFd::as_raw_fd(&heap);

    let mut fds = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut data = DmaHeapAllocationData {
            len: size as u64,
            fd: 0,
            fd_flags: libc::O_RDWR as u32,
            heap_flags: 0,
        };
        let ret = unsafe { libc::ioctl(heap_fd, dma_heap_ioctl_alloc(), &mut data as *mut DmaHeapAllocationData) };
        if ret != 0 {
            anyhow::bail!("DMA_HEAP_IOCTL_ALLOC failed: {}", std::io::Error::last_os_error());
        }
        fds.push(data.fd as RawFd);
    }
    Ok(fds)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::load().context("loading configuration")?;

    let device = Device::open(&config.device_path, &config.media_device_path)
        .context("opening V4L2 decoder device")?;
    let coded_fmt = device
        .negotiate_coded_format(cli.width, cli.height)
        .context("negotiating coded-input format")?;
    let decoded_fmt = device
        .negotiate_decoded_format(cli.width, cli.height, &config.preferred_pixel_format)
        .context("negotiating decoded-output format")?;
    tracing::info!(
        "negotiated coded {}x{} / decoded {}x{} (size_image={})",
        coded_fmt.width,
        coded_fmt.height,
        decoded_fmt.width,
        decoded_fmt.height,
        decoded_fmt.size_image()
    );

    let video_fd = device.raw_fd();
    let coded = CodedPool::init(video_fd, config.output_buffer_count)?;

    let decoded = if config.use_dma_prime_buffers {
        let dmabuf_fds = allocate_dmabufs(config.capture_buffer_count, decoded_fmt.size_image())?;
        DecodedPool::init_dmabuf(video_fd, dmabuf_fds, decoded_fmt.size_image(), 0)?
    } else {
        DecodedPool::init_mmap(video_fd, config.capture_buffer_count)?
    };

    let requests = RequestPool::allocate(device.media_raw_fd(), config.request_pool_size)?;

    let frame_count = Arc::new(AtomicU64::new(0));
    let counted = frame_count.clone();
    let consumer = LocalConsumer::new(move |_slot| {
        counted.fetch_add(1, Ordering::Relaxed);
    });

    let loop_ = DecodeLoop::with_drain_idle_budget(video_fd, coded, decoded, requests, config.drain_idle_budget_ms);
    let input = std::fs::File::open(&cli.input)
        .with_context(|| format!("opening input file {}", cli.input.display()))?;

    let stats = loop_.run(input, Box::new(consumer)).context("decode loop failed")?;
    println!("decoded {} frames", stats.frames_decoded);
    Ok(())
}

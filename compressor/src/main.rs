use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use astc_compression::{
    AstcCompressor, BlockFootprint, Image, PsnrEvaluator, PsnrOutcome, Settings, WgpuQueue,
};
use clap::Parser;
use image::ImageReader;
use pollster::block_on;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wgpu::{
    BackendOptions, Backends, Device, DeviceDescriptor, Dx12BackendOptions, Dx12Compiler, Error,
    Features, GlBackendOptions, Gles3MinorVersion, Instance, InstanceDescriptor, InstanceFlags,
    MemoryHints, PowerPreference, Queue,
};

/// Compresses an image to ASTC on the GPU and reports the quality loss.
#[derive(Parser, Debug)]
#[command(name = "compressor", version)]
struct Cli {
    /// Block footprint: rgb4x4, rgba4x4, rgb6x6 or rgba6x6
    footprint: BlockFootprint,

    /// Image to compress
    input: PathBuf,

    /// WGSL module with the compression entry points
    #[arg(long)]
    kernel: PathBuf,

    /// Measure the PSNR of the compressed image
    #[arg(long)]
    psnr: bool,

    /// Give up on a GPU readback after this many milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// PSNR reported for identical images
    #[arg(long, default_value_t = Settings::DEFAULT_MAX_PSNR, value_parser = parse_max_psnr)]
    max_psnr: f64,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        let filter = if cli.verbose {
            EnvFilter::new("astc_compression=debug,compressor=debug")
        } else {
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("astc_compression=warn,compressor=info"))
        };
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match run(&cli) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(message) => {
            error!("{message}");
            eprintln!("Error: {message}");
            std::process::ExitCode::FAILURE
        }
    }
}

fn parse_max_psnr(value: &str) -> Result<f64, String> {
    let max_psnr: f64 = value.parse().map_err(|err| format!("{err}"))?;

    if max_psnr.is_finite() && max_psnr > 0.0 {
        Ok(max_psnr)
    } else {
        Err(format!("expected a finite, positive PSNR in dB, got {value}"))
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let settings = Settings::new()
        .with_readback_timeout(Duration::from_millis(cli.timeout_ms))
        .with_max_psnr(cli.max_psnr);

    let (device, queue) = create_resources()?;

    let kernel_source = fs::read_to_string(&cli.kernel)
        .map_err(|err| format!("can't read kernel {}: {err}", cli.kernel.display()))?;
    let compute_queue = WgpuQueue::new(device, queue);
    let module = compute_queue
        .create_astc_kernel_module("astc compression kernel", &kernel_source)
        .map_err(|err| err.to_string())?;
    let compute_queue = Arc::new(compute_queue.with_astc_kernel(&module));

    let start = Instant::now();

    let image = read_image(&cli.input)?;

    let duration = start.elapsed();
    println!(
        "Image read took: {:.3} ms",
        duration.as_secs_f64() * 1000.0
    );

    let compressor = AstcCompressor::new(compute_queue.clone(), settings);

    let start = Instant::now();

    let compressed = compressor
        .run(&image, cli.footprint)
        .map_err(|err| err.to_string())?;

    let duration = start.elapsed();
    println!(
        "Compression took: {:.3} ms",
        duration.as_secs_f64() * 1000.0
    );

    let mut astc_name = cli.input.clone();
    astc_name.set_extension("astc");
    fs::write(&astc_name, compressed.data())
        .map_err(|err| format!("failed to write {}: {err}", astc_name.display()))?;
    info!(path = %astc_name.display(), bytes = compressed.data().len(), "wrote artifact");

    if cli.psnr {
        let evaluator = PsnrEvaluator::new(compute_queue, settings);

        let start = Instant::now();

        let outcome = evaluator
            .evaluate(&image, &compressed)
            .map_err(|err| err.to_string())?;

        let duration = start.elapsed();

        match outcome {
            PsnrOutcome::Measured(report) => {
                println!("PSNR: {:.2} dB (MSE {:.6})", report.psnr, report.mse);
            }
            PsnrOutcome::Incomparable { source, target } => {
                return Err(format!(
                    "images are not comparable: {source:?} vs {target:?}"
                ));
            }
        }
        println!(
            "PSNR evaluation took: {:.3} ms",
            duration.as_secs_f64() * 1000.0
        );
    }

    Ok(())
}

fn create_resources() -> Result<(Arc<Device>, Arc<Queue>), String> {
    let instance = Instance::new(&InstanceDescriptor {
        backends: Backends::from_env().unwrap_or_default(),
        flags: InstanceFlags::from_build_config().with_env(),
        backend_options: BackendOptions {
            gl: GlBackendOptions {
                gles_minor_version: Gles3MinorVersion::Version1,
            },
            dx12: Dx12BackendOptions {
                shader_compiler: Dx12Compiler::Fxc,
            }
            .with_env(),
        },
    });

    let adapter = block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }))
    .ok_or("failed to find an appropriate adapter")?;

    // ASTC textures are only needed to measure the PSNR of the output.
    let required_features = adapter.features() & Features::TEXTURE_COMPRESSION_ASTC;

    let (device, queue) = block_on(adapter.request_device(
        &DeviceDescriptor {
            label: Some("main device"),
            required_features,
            // Inputs may be larger than the 2048 texel textures of the downlevel limits.
            required_limits: adapter.limits(),
            memory_hints: MemoryHints::Performance,
        },
        None,
    ))
    .map_err(|err| format!("failed to create device: {err}"))?;
    device.on_uncaptured_error(Box::new(error_handler));

    let info = adapter.get_info();
    println!("Using backend: {:?}", info.backend);

    Ok((Arc::new(device), Arc::new(queue)))
}

fn read_image(path: &Path) -> Result<Image, String> {
    let image = ImageReader::open(path)
        .map_err(|err| format!("can't open input image: {err}"))?
        .decode()
        .map_err(|err| format!("can't decode image: {err}"))?;

    let rgba_image = image.to_rgba8();
    let width = rgba_image.width();
    let height = rgba_image.height();

    Image::from_rgba8(width, height, rgba_image.into_raw()).map_err(|err| err.to_string())
}

pub fn error_handler(error: Error) {
    let (message_type, message) = match error {
        Error::OutOfMemory { source } => ("OutOfMemory", source.to_string()),
        Error::Validation {
            source,
            description,
        } => ("Validation", format!("{source}: {description}")),
        Error::Internal {
            source,
            description,
        } => ("Internal", format!("{source}: {description}")),
    };

    panic!("wgpu [{message_type}] [error]: {message}");
}

#![allow(dead_code)]

use std::sync::Arc;

use astc_compression::{Image, SoftwareQueue, VoidExtentKernel, WgpuQueue};
use pollster::block_on;
use wgpu::{
    BackendOptions, Backends, Device, DeviceDescriptor, Dx12BackendOptions, Dx12Compiler, Error,
    Features, GlBackendOptions, Gles3MinorVersion, Instance, InstanceDescriptor, InstanceFlags,
    MemoryHints, Queue,
};

pub const VOID_EXTENT_KERNEL: &str = include_str!("../shader/void_extent.wgsl");

/// Creates a device, or `None` when the machine has no usable adapter.
pub fn create_wgpu_resources() -> Option<(Arc<Device>, Arc<Queue>)> {
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

    let Some(adapter) = block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    })) else {
        eprintln!("no wgpu adapter available, skipping");
        return None;
    };

    let (device, queue) = block_on(adapter.request_device(
        &DeviceDescriptor {
            label: Some("main device"),
            required_features: adapter.features() & Features::TEXTURE_COMPRESSION_ASTC,
            required_limits: adapter.limits(),
            memory_hints: MemoryHints::default(),
        },
        None,
    ))
    .expect("Failed to create device");
    device.on_uncaptured_error(Box::new(error_handler));

    Some((Arc::new(device), Arc::new(queue)))
}

/// A wgpu queue with the void-extent test kernel registered for every footprint.
pub fn create_wgpu_queue() -> Option<Arc<WgpuQueue>> {
    let (device, queue) = create_wgpu_resources()?;
    let compute_queue = WgpuQueue::new(device, queue);
    let module = compute_queue
        .create_astc_kernel_module("void extent kernel", VOID_EXTENT_KERNEL)
        .expect("test kernel compiles");

    Some(Arc::new(compute_queue.with_astc_kernel(&module)))
}

pub fn create_software_queue() -> Arc<SoftwareQueue> {
    Arc::new(SoftwareQueue::new(VoidExtentKernel))
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

pub fn solid_image(width: u32, height: u32, rgba: [u8; 4]) -> Image {
    Image::from_rgba8(width, height, rgba.repeat((width * height) as usize))
        .expect("valid solid image")
}

/// Diagonal gradient with a checkerboarded alpha channel.
pub fn gradient_image(width: u32, height: u32) -> Image {
    let mut data = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            data.push((x * 255 / width.max(1)) as u8);
            data.push((y * 255 / height.max(1)) as u8);
            data.push(((x + y) * 127 / (width + height).max(1)) as u8);
            data.push(if (x / 4 + y / 4) % 2 == 0 { 255 } else { 128 });
        }
    }

    Image::from_rgba8(width, height, data).expect("valid gradient image")
}

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytemuck::bytes_of;
use pollster::block_on;
use tracing::{debug, trace, warn};
use wgpu::{
    self, include_wgsl,
    util::{BufferInitDescriptor, DeviceExt, TextureDataOrder},
    AstcBlock, AstcChannel, BindGroupDescriptor, BindGroupEntry, BindGroupLayout,
    BindGroupLayoutDescriptor, BindGroupLayoutEntry, BindingResource, BindingType, Buffer,
    BufferBindingType, BufferDescriptor, BufferUsages, CommandEncoderDescriptor,
    ComputePassDescriptor, ComputePipeline, ComputePipelineDescriptor, Device, ErrorFilter,
    Extent3d, Features, Maintain, MapMode, PipelineCompilationOptions, PipelineLayoutDescriptor,
    Queue, ShaderModule, ShaderModuleDescriptor, ShaderSource, ShaderStages, Texture,
    TextureDescriptor, TextureDimension, TextureFormat, TextureSampleType, TextureUsages,
    TextureView, TextureViewDescriptor, TextureViewDimension,
};

use super::{CompressionParams, ComputeQueue, ReductionParams};
use crate::{AstcError, BlockFootprint, Image, PixelFormat, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// An image uploaded as a sampled texture.
pub struct WgpuTexture {
    texture: Texture,
    view: TextureView,
}

impl WgpuTexture {
    pub fn texture(&self) -> &Texture {
        &self.texture
    }

    pub fn view(&self) -> &TextureView {
        &self.view
    }
}

/// A storage buffer, destroyed when dropped.
pub struct WgpuBuffer {
    buffer: Buffer,
    label: String,
}

impl WgpuBuffer {
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }
}

impl Drop for WgpuBuffer {
    fn drop(&mut self) {
        self.buffer.destroy();
        trace!(label = %self.label, size = self.buffer.size(), "released buffer");
    }
}

/// Runs the compression and reduction kernels on a WGPU device.
///
/// The PSNR reduction shader is built in. The ASTC compression kernel is supplied
/// by the caller as a WGSL module exposing one entry point per footprint, see
/// [`BlockFootprint::entry_point`]. Each entry point runs with a workgroup size
/// of 8x8 and binds:
///
///  * `@binding(0)` the source `texture_2d<f32>`
///  * `@binding(1)` the output blocks, `array<vec4<u32>>` read-write storage
///  * `@binding(2)` the [`CompressionParams`] uniform
///
/// The queue can be shared between threads. Device calls that may raise
/// validation errors are serialized, readbacks wait outside the lock.
pub struct WgpuQueue {
    compression_layout: BindGroupLayout,
    compression_pipelines: HashMap<BlockFootprint, ComputePipeline>,
    reduction_layout: BindGroupLayout,
    reduction_pipeline: ComputePipeline,
    empty_partials: Buffer,
    validation_lock: Mutex<()>,
    device: Arc<Device>,
    queue: Arc<Queue>,
}

impl WgpuQueue {
    pub fn new(device: Arc<Device>, queue: Arc<Queue>) -> Self {
        let compression_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("astc compression bind group layout"),
            entries: &[
                texture_entry(0),
                storage_entry(1, false),
                BindGroupLayoutEntry {
                    binding: 2,
                    visibility: ShaderStages::COMPUTE,
                    ty: BindingType::Buffer {
                        ty: BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let reduction_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("psnr reduction bind group layout"),
            entries: &[
                texture_entry(0),
                texture_entry(1),
                storage_entry(2, true),
                storage_entry(3, false),
                BindGroupLayoutEntry {
                    binding: 4,
                    visibility: ShaderStages::COMPUTE,
                    ty: BindingType::Buffer {
                        ty: BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let reduction_module =
            device.create_shader_module(include_wgsl!("../shader/psnr_reduce.wgsl"));

        let reduction_pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("psnr reduction pipeline layout"),
            bind_group_layouts: &[&reduction_layout],
            push_constant_ranges: &[],
        });

        let reduction_pipeline = device.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("psnr reduction pipeline"),
            layout: Some(&reduction_pipeline_layout),
            module: &reduction_module,
            entry_point: Some("reduce_squared_error"),
            compilation_options: PipelineCompilationOptions::default(),
            cache: None,
        });

        // Bound in place of the partial sums during the first pass.
        let empty_partials = device.create_buffer(&BufferDescriptor {
            label: Some("empty partial sums"),
            size: 16,
            usage: BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        Self {
            compression_layout,
            compression_pipelines: HashMap::new(),
            reduction_layout,
            reduction_pipeline,
            empty_partials,
            validation_lock: Mutex::new(()),
            device,
            queue,
        }
    }

    /// Registers every footprint whose entry point exists in `module`.
    pub fn with_astc_kernel(mut self, module: &ShaderModule) -> Self {
        for footprint in BlockFootprint::ALL {
            if let Err(error) = self.register_astc_kernel(footprint, module) {
                warn!(%footprint, %error, "compression kernel not available");
            }
        }
        self
    }

    /// Compiles WGSL source of a compression kernel.
    pub fn create_astc_kernel_module(&self, label: &str, wgsl: &str) -> Result<ShaderModule> {
        let (module, error) = self.validation_scope(|| {
            self.device.create_shader_module(ShaderModuleDescriptor {
                label: Some(label),
                source: ShaderSource::Wgsl(wgsl.into()),
            })
        });

        match error {
            Some(error) => Err(AstcError::PreconditionMissing(format!(
                "valid compression kernel '{label}': {error}"
            ))),
            None => Ok(module),
        }
    }

    /// Creates the pipeline of `footprint` from its entry point in `module`.
    pub fn register_astc_kernel(
        &mut self,
        footprint: BlockFootprint,
        module: &ShaderModule,
    ) -> Result<()> {
        let name = footprint.to_string();

        let (pipeline, error) = self.validation_scope(|| {
            let pipeline_layout = self
                .device
                .create_pipeline_layout(&PipelineLayoutDescriptor {
                    label: Some(&format!("{name} compression pipeline layout")),
                    bind_group_layouts: &[&self.compression_layout],
                    push_constant_ranges: &[],
                });

            self.device
                .create_compute_pipeline(&ComputePipelineDescriptor {
                    label: Some(&format!("{name} compression pipeline")),
                    layout: Some(&pipeline_layout),
                    module,
                    entry_point: Some(footprint.entry_point()),
                    compilation_options: PipelineCompilationOptions::default(),
                    cache: None,
                })
        });

        if let Some(error) = error {
            return Err(AstcError::PreconditionMissing(format!(
                "compression kernel entry point '{}': {error}",
                footprint.entry_point()
            )));
        }

        debug!(%footprint, entry_point = footprint.entry_point(), "registered compression kernel");
        self.compression_pipelines.insert(footprint, pipeline);
        Ok(())
    }

    pub fn has_astc_kernel(&self, footprint: BlockFootprint) -> bool {
        self.compression_pipelines.contains_key(&footprint)
    }

    /// Whether ASTC images can be uploaded, which PSNR on compressed images requires.
    pub fn supports_astc_textures(&self) -> bool {
        self.device
            .features()
            .contains(Features::TEXTURE_COMPRESSION_ASTC)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn check_workgroups(&self, workgroups: [u32; 3]) -> Result<()> {
        let limit = self.device.limits().max_compute_workgroups_per_dimension;
        if workgroups.iter().any(|&count| count == 0 || count > limit) {
            return Err(AstcError::DispatchFailed(format!(
                "workgroups {workgroups:?} outside 1..={limit}"
            )));
        }
        Ok(())
    }

    /// Records a single compute pass, submits it and reports validation errors.
    fn submit_pass(
        &self,
        label: &str,
        pipeline: &ComputePipeline,
        bind_group: &wgpu::BindGroup,
        workgroups: [u32; 3],
    ) -> Result<()> {
        let mut encoder = self
            .device
            .create_command_encoder(&CommandEncoderDescriptor {
                label: Some(label),
            });

        {
            let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });

            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(workgroups[0], workgroups[1], workgroups[2]);
        }

        self.queue.submit([encoder.finish()]);
        Ok(())
    }

    /// Runs `f` inside a validation error scope.
    ///
    /// Error scopes form one stack per device, so scopes of concurrent callers
    /// must not interleave. `f` must not open another scope.
    fn validation_scope<T>(&self, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        let _guard = self
            .validation_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        self.device.push_error_scope(ErrorFilter::Validation);
        let value = f();
        let error = block_on(self.device.pop_error_scope());

        (value, error)
    }

    fn with_validation<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        match self.validation_scope(f) {
            (Err(error), _) => Err(error),
            (Ok(_), Some(error)) => Err(AstcError::DispatchFailed(error.to_string())),
            (Ok(value), None) => Ok(value),
        }
    }
}

fn texture_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Texture {
            sample_type: TextureSampleType::Float { filterable: true },
            view_dimension: TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Buffer {
            ty: BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Polls until the mapping callback reports back or `timeout` has elapsed.
fn wait_for_mapping<E: Display>(
    receiver: &Receiver<std::result::Result<(), E>>,
    mut poll: impl FnMut(),
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;

    loop {
        poll();

        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(error)) => return Err(AstcError::ReadbackFailed(error.to_string())),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(AstcError::ReadbackFailed(
                    "map callback was dropped".to_string(),
                ))
            }
            Err(RecvTimeoutError::Timeout) if Instant::now() >= deadline => {
                return Err(AstcError::ReadbackTimeout(timeout))
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

const fn astc_block(footprint: BlockFootprint) -> AstcBlock {
    match footprint {
        BlockFootprint::Rgb4x4 | BlockFootprint::Rgba4x4 => AstcBlock::B4x4,
        BlockFootprint::Rgb6x6 | BlockFootprint::Rgba6x6 => AstcBlock::B6x6,
    }
}

impl ComputeQueue for WgpuQueue {
    type Texture = WgpuTexture;
    type Buffer = WgpuBuffer;

    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn upload_image(&self, image: &Image) -> Result<Self::Texture> {
        let (format, width, height, data) = match image.format() {
            PixelFormat::Rgba8Unorm => (
                TextureFormat::Rgba8Unorm,
                image.width(),
                image.height(),
                image.data(),
            ),
            PixelFormat::Astc(footprint) => {
                if !self.supports_astc_textures() {
                    return Err(AstcError::PreconditionMissing(
                        "device feature TEXTURE_COMPRESSION_ASTC".to_string(),
                    ));
                }

                // Compressed textures must span whole blocks.
                let edge = footprint.edge_length();
                let format = TextureFormat::Astc {
                    block: astc_block(footprint),
                    channel: AstcChannel::Unorm,
                };
                let data = image.block_data().unwrap_or_default();
                (
                    format,
                    image.width().div_ceil(edge) * edge,
                    image.height().div_ceil(edge) * edge,
                    data,
                )
            }
        };

        let limit = self.device.limits().max_texture_dimension_2d;
        if width > limit || height > limit {
            return Err(AstcError::PreconditionMissing(format!(
                "texture size {width}x{height} within device limit {limit}"
            )));
        }

        let texture = self.with_validation(|| {
            Ok(self.device.create_texture_with_data(
                &self.queue,
                &TextureDescriptor {
                    label: Some("uploaded image"),
                    size: Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: TextureDimension::D2,
                    format,
                    usage: TextureUsages::COPY_DST | TextureUsages::TEXTURE_BINDING,
                    view_formats: &[],
                },
                TextureDataOrder::LayerMajor,
                data,
            ))
        })?;
        let view = texture.create_view(&TextureViewDescriptor::default());

        Ok(WgpuTexture { texture, view })
    }

    fn create_buffer(&self, label: &str, size: u64) -> Result<Self::Buffer> {
        let limit = self.device.limits().max_storage_buffer_binding_size as u64;
        if size > limit {
            return Err(AstcError::PreconditionMissing(format!(
                "storage buffer of {size} bytes within device limit {limit}"
            )));
        }

        let buffer = self.with_validation(|| {
            Ok(self.device.create_buffer(&BufferDescriptor {
                label: Some(label),
                size,
                usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            }))
        })?;
        trace!(label, size, "allocated buffer");

        Ok(WgpuBuffer {
            buffer,
            label: label.to_string(),
        })
    }

    fn dispatch_compression(
        &self,
        footprint: BlockFootprint,
        source: &Self::Texture,
        output: &mut Self::Buffer,
        params: CompressionParams,
        workgroups: [u32; 3],
    ) -> Result<()> {
        let pipeline = self.compression_pipelines.get(&footprint).ok_or_else(|| {
            AstcError::PreconditionMissing(format!(
                "compression kernel entry point '{}'",
                footprint.entry_point()
            ))
        })?;
        self.check_workgroups(workgroups)?;

        self.with_validation(|| {
            let uniforms = self.device.create_buffer_init(&BufferInitDescriptor {
                label: Some("compression uniforms"),
                contents: bytes_of(&params),
                usage: BufferUsages::UNIFORM,
            });

            let bind_group = self.device.create_bind_group(&BindGroupDescriptor {
                label: Some("astc compression bind group"),
                layout: &self.compression_layout,
                entries: &[
                    BindGroupEntry {
                        binding: 0,
                        resource: BindingResource::TextureView(&source.view),
                    },
                    BindGroupEntry {
                        binding: 1,
                        resource: output.buffer.as_entire_binding(),
                    },
                    BindGroupEntry {
                        binding: 2,
                        resource: uniforms.as_entire_binding(),
                    },
                ],
            });

            self.submit_pass("astc compression", pipeline, &bind_group, workgroups)
        })
    }

    fn dispatch_reduction(
        &self,
        source: &Self::Texture,
        target: &Self::Texture,
        partials: Option<&Self::Buffer>,
        output: &mut Self::Buffer,
        params: ReductionParams,
        workgroups: [u32; 3],
    ) -> Result<()> {
        self.check_workgroups(workgroups)?;

        let partials = match (params.first_step != 0, partials) {
            (true, _) => &self.empty_partials,
            (false, Some(partials)) => &partials.buffer,
            (false, None) => {
                return Err(AstcError::DispatchFailed(
                    "reduction pass without partial sums".to_string(),
                ))
            }
        };

        self.with_validation(|| {
            let uniforms = self.device.create_buffer_init(&BufferInitDescriptor {
                label: Some("reduction uniforms"),
                contents: bytes_of(&params),
                usage: BufferUsages::UNIFORM,
            });

            let bind_group = self.device.create_bind_group(&BindGroupDescriptor {
                label: Some("psnr reduction bind group"),
                layout: &self.reduction_layout,
                entries: &[
                    BindGroupEntry {
                        binding: 0,
                        resource: BindingResource::TextureView(&source.view),
                    },
                    BindGroupEntry {
                        binding: 1,
                        resource: BindingResource::TextureView(&target.view),
                    },
                    BindGroupEntry {
                        binding: 2,
                        resource: partials.as_entire_binding(),
                    },
                    BindGroupEntry {
                        binding: 3,
                        resource: output.buffer.as_entire_binding(),
                    },
                    BindGroupEntry {
                        binding: 4,
                        resource: uniforms.as_entire_binding(),
                    },
                ],
            });

            self.submit_pass(
                "psnr reduction",
                &self.reduction_pipeline,
                &bind_group,
                workgroups,
            )
        })
    }

    fn read_buffer(&self, buffer: &Self::Buffer, size: u64, timeout: Duration) -> Result<Vec<u8>> {
        if size > buffer.buffer.size() {
            return Err(AstcError::BufferSizeMismatch {
                expected: size as usize,
                actual: buffer.buffer.size() as usize,
            });
        }

        let staging_buffer = self.with_validation(|| {
            let staging_buffer = self.device.create_buffer(&BufferDescriptor {
                label: Some("staging buffer"),
                size,
                usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
                mapped_at_creation: false,
            });

            let mut copy_encoder = self
                .device
                .create_command_encoder(&CommandEncoderDescriptor {
                    label: Some("copy encoder"),
                });

            copy_encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &staging_buffer, 0, size);

            self.queue.submit([copy_encoder.finish()]);
            Ok(staging_buffer)
        })?;

        let result;

        {
            let buffer_slice = staging_buffer.slice(..);

            let (tx, rx) = mpsc::channel();
            buffer_slice.map_async(MapMode::Read, move |v| {
                let _ = tx.send(v);
            });

            let poll = || {
                let _ = self.device.poll(Maintain::Poll);
            };
            if let Err(error) = wait_for_mapping(&rx, poll, timeout) {
                if matches!(error, AstcError::ReadbackTimeout(_)) {
                    warn!(label = %buffer.label, ?timeout, "buffer readback timed out");
                }
                return Err(error);
            }

            result = buffer_slice.get_mapped_range().to_vec();
        }

        staging_buffer.unmap();

        Ok(result)
    }
}

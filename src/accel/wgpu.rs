//! GPU accelerator using WGPU.
//!
//! Kernels are WGSL modules specialised by their build options. The shape
//! defines are baked in as constants while the work-group size is a
//! pipeline-level constant too, so each kernel keeps one pipeline per
//! work-group size it has been dispatched with.
//!
//! The device and queue are created once per process via `lazy_static` and
//! shared by every [`WgpuAccelerator`]. Device-side validation failures are
//! caught with error scopes and surfaced as [`DeviceFault`]s.

use super::{Accelerator, DeviceArg, DeviceBufferId, KernelId, KernelOptions};
use crate::error::DeviceFault;
use crate::kernels::KernelSource;
use std::collections::HashMap;
use std::sync::mpsc;
use tracing::{debug, trace, warn};
use wgpu::util::DeviceExt;

/// Largest group count along one dispatch dimension.
const MAX_GROUPS_PER_DIMENSION: usize = 65_535;

/// Basic wrapper for GPU acquisition errors.
#[derive(Debug)]
pub enum GpuError {
    /// No adapter matched the request.
    Adapter(wgpu::RequestAdapterError),
    /// The adapter refused to open a device.
    Device(wgpu::RequestDeviceError),
}

impl std::fmt::Display for GpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adapter(e) => write!(f, "Adapter error: {e}"),
            Self::Device(e) => write!(f, "Device error: {e}"),
        }
    }
}

impl std::error::Error for GpuError {}

/// Device and queue shared by every [`WgpuAccelerator`].
#[derive(Debug, Clone)]
pub struct GpuContext {
    /// The GPU device.
    pub device: wgpu::Device,
    /// Its submission queue.
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Opens the default adapter with its full limits, so that large
    /// work-groups are available to the scratch kernels.
    ///
    /// # Errors
    ///
    /// [`GpuError`] when no adapter or device can be acquired.
    pub fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
                .map_err(GpuError::Adapter)?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("briny_conv"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(GpuError::Device)?;
        Ok(Self { device, queue })
    }
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: Result<GpuContext, DeviceFault> = GpuContext::new().map_err(|e| {
        warn!(error = %e, "wgpu unavailable");
        DeviceFault::NoAdapter
    });
}

#[derive(Debug)]
struct GpuBuffer {
    buffer: wgpu::Buffer,
    len: usize,
}

#[derive(Debug)]
struct WgpuKernel {
    source: KernelSource,
    options: KernelOptions,
    pipelines: HashMap<usize, wgpu::ComputePipeline>,
}

/// [`Accelerator`] over the shared WGPU device.
#[derive(Debug)]
pub struct WgpuAccelerator {
    device: wgpu::Device,
    queue: wgpu::Queue,
    max_workgroup_size: usize,
    kernels: Vec<WgpuKernel>,
    buffers: Vec<Option<GpuBuffer>>,
}

fn dispatch_fault(kernel: &str, reason: impl Into<String>) -> DeviceFault {
    DeviceFault::Dispatch {
        kernel: kernel.to_owned(),
        reason: reason.into(),
    }
}

/// Splits `groups` over x and y so neither exceeds the per-dimension limit.
fn group_grid(groups: usize) -> (u32, u32) {
    if groups <= MAX_GROUPS_PER_DIMENSION {
        (groups as u32, 1)
    } else {
        (
            MAX_GROUPS_PER_DIMENSION as u32,
            groups.div_ceil(MAX_GROUPS_PER_DIMENSION) as u32,
        )
    }
}

fn byte_len(len: usize) -> u64 {
    // zero-sized storage bindings are invalid
    (len.max(1) * core::mem::size_of::<f32>()) as u64
}

impl WgpuAccelerator {
    /// Accelerator over the process-wide device.
    ///
    /// # Errors
    ///
    /// [`DeviceFault::NoAdapter`] when no GPU could be opened.
    pub fn new() -> Result<Self, DeviceFault> {
        let ctx = GPU_CONTEXT.as_ref().map_err(Clone::clone)?;
        let limits = ctx.device.limits();
        let max_workgroup_size = limits
            .max_compute_invocations_per_workgroup
            .min(limits.max_compute_workgroup_size_x) as usize;
        debug!(max_workgroup_size, "opened wgpu accelerator");
        Ok(Self {
            device: ctx.device.clone(),
            queue: ctx.queue.clone(),
            max_workgroup_size,
            kernels: Vec::new(),
            buffers: Vec::new(),
        })
    }

    fn gpu_buffer(&self, id: DeviceBufferId) -> Result<&GpuBuffer, DeviceFault> {
        self.buffers
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(DeviceFault::UnknownBuffer(id.0))
    }

    /// Compiles `source` for one work-group size, reporting WGSL and
    /// pipeline validation errors as build faults.
    fn compile(
        device: &wgpu::Device,
        source: &KernelSource,
        options: &KernelOptions,
        workgroup_size: usize,
    ) -> Result<wgpu::ComputePipeline, DeviceFault> {
        let wgsl = source.module_source(options, workgroup_size)?;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(source.name),
            source: wgpu::ShaderSource::Wgsl(wgsl.into()),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(source.name),
            layout: None,
            module: &module,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        match pollster::block_on(device.pop_error_scope()) {
            Some(e) => Err(source.build_fault(e.to_string())),
            None => Ok(pipeline),
        }
    }

    fn ensure_pipeline(&mut self, kernel: KernelId, workgroup_size: usize) -> Result<(), DeviceFault> {
        let entry = self
            .kernels
            .get_mut(kernel.0)
            .ok_or(DeviceFault::UnknownKernel(kernel.0))?;
        if !entry.pipelines.contains_key(&workgroup_size) {
            trace!(kernel = entry.source.name, workgroup_size, "compiling pipeline");
            let pipeline = Self::compile(&self.device, &entry.source, &entry.options, workgroup_size)?;
            entry.pipelines.insert(workgroup_size, pipeline);
        }
        Ok(())
    }
}

impl Accelerator for WgpuAccelerator {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn max_workgroup_size(&self) -> usize {
        self.max_workgroup_size
    }

    fn build_kernel(
        &mut self,
        source: &KernelSource,
        options: &KernelOptions,
    ) -> Result<KernelId, DeviceFault> {
        // other work-group sizes are compiled on first dispatch
        let pipeline = Self::compile(&self.device, source, options, 1)?;
        self.kernels.push(WgpuKernel {
            source: *source,
            options: options.clone(),
            pipelines: HashMap::from([(1, pipeline)]),
        });
        Ok(KernelId(self.kernels.len() - 1))
    }

    fn alloc(&mut self, len: usize) -> Result<DeviceBufferId, DeviceFault> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: byte_len(len),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let entry = Some(GpuBuffer { buffer, len });
        Ok(DeviceBufferId(match self.buffers.iter().position(Option::is_none) {
            Some(i) => {
                self.buffers[i] = entry;
                i
            }
            None => {
                self.buffers.push(entry);
                self.buffers.len() - 1
            }
        }))
    }

    fn write(&mut self, buffer: DeviceBufferId, data: &[f32]) -> Result<(), DeviceFault> {
        let dst = self.gpu_buffer(buffer)?;
        if data.len() > dst.len {
            return Err(DeviceFault::Transfer(format!(
                "write of {} elements into buffer #{} of {}",
                data.len(),
                buffer.0,
                dst.len
            )));
        }
        if !data.is_empty() {
            self.queue
                .write_buffer(&dst.buffer, 0, bytemuck::cast_slice(data));
        }
        Ok(())
    }

    fn read(&mut self, buffer: DeviceBufferId, out: &mut [f32]) -> Result<(), DeviceFault> {
        let src = self.gpu_buffer(buffer)?;
        if out.len() > src.len {
            return Err(DeviceFault::Transfer(format!(
                "read of {} elements from buffer #{} of {}",
                out.len(),
                buffer.0,
                src.len
            )));
        }
        if out.is_empty() {
            return Ok(());
        }

        let size = byte_len(out.len());
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("read") });
        encoder.copy_buffer_to_buffer(&src.buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| DeviceFault::Transfer(e.to_string()))?;
        rx.recv()
            .map_err(|e| DeviceFault::Transfer(e.to_string()))?
            .map_err(|e| DeviceFault::Transfer(e.to_string()))?;

        {
            let data = slice.get_mapped_range();
            out.copy_from_slice(bytemuck::cast_slice(&data));
        }
        staging.unmap();
        Ok(())
    }

    fn free(&mut self, buffer: DeviceBufferId) -> Result<(), DeviceFault> {
        let entry = self
            .buffers
            .get_mut(buffer.0)
            .and_then(Option::take)
            .ok_or(DeviceFault::UnknownBuffer(buffer.0))?;
        entry.buffer.destroy();
        Ok(())
    }

    fn dispatch(
        &mut self,
        kernel: KernelId,
        args: &[DeviceArg],
        global_size: usize,
        workgroup_size: usize,
    ) -> Result<(), DeviceFault> {
        let name = self
            .kernels
            .get(kernel.0)
            .ok_or(DeviceFault::UnknownKernel(kernel.0))?
            .source
            .name;
        if workgroup_size == 0 || workgroup_size > self.max_workgroup_size {
            return Err(dispatch_fault(
                name,
                format!(
                    "work-group size {workgroup_size} outside 1..={}",
                    self.max_workgroup_size
                ),
            ));
        }
        if global_size % workgroup_size != 0 {
            return Err(dispatch_fault(
                name,
                format!("global size {global_size} is not a multiple of {workgroup_size}"),
            ));
        }

        let mut params: Vec<u32> = Vec::new();
        let mut buffers = Vec::new();
        for arg in args {
            match *arg {
                DeviceArg::Int(v) => params.push(bytemuck::cast(v)),
                DeviceArg::Float(v) => params.push(v.to_bits()),
                DeviceArg::Buffer(id) => buffers.push(id),
                // scratch is declared statically in the module
                DeviceArg::Local(_) => {}
            }
        }
        if params.is_empty() {
            params.push(0);
        }
        let params = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("params"),
                contents: bytemuck::cast_slice(&params),
                usage: wgpu::BufferUsages::STORAGE,
            });

        let (groups_x, groups_y) = group_grid(global_size / workgroup_size);
        trace!(kernel = name, global_size, workgroup_size, groups_x, groups_y, "dispatch");

        self.ensure_pipeline(kernel, workgroup_size)?;
        let pipeline = self.kernels[kernel.0]
            .pipelines
            .get(&workgroup_size)
            .ok_or(DeviceFault::UnknownKernel(kernel.0))?;
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: params.as_entire_binding(),
        }];
        for (i, id) in buffers.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: self.gpu_buffer(*id)?.buffer.as_entire_binding(),
            });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(name),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(name) });
        if groups_x > 0 {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(name),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        self.queue.submit(Some(encoder.finish()));

        match pollster::block_on(self.device.pop_error_scope()) {
            Some(e) => Err(dispatch_fault(name, e.to_string())),
            None => Ok(()),
        }
    }

    fn finish(&mut self) -> Result<(), DeviceFault> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| dispatch_fault("finish", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_dispatches_fold_into_two_dimensions() {
        assert_eq!(group_grid(1), (1, 1));
        assert_eq!(group_grid(65_535), (65_535, 1));
        assert_eq!(group_grid(65_536), (65_535, 2));
        assert_eq!(group_grid(200_000), (65_535, 4));
    }

    #[test]
    fn empty_buffers_still_bind_one_word() {
        assert_eq!(byte_len(0), 4);
        assert_eq!(byte_len(3), 12);
    }
}

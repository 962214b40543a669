//! Accelerator substrate.
//!
//! The convolution engine only needs five verbs from whatever executes its
//! kernels: build a named kernel from source plus option defines, bind a
//! buffer, push/pull data, dispatch with a work-group size, and wait for
//! completion. [`Accelerator`] captures exactly those.
//!
//! Two implementations exist:
//!
//! - [`host::HostAccelerator`] runs every named kernel on the CPU with
//!   `rayon`, emulating work-groups and scratch space. It is the default and
//!   the fallback.
//! - `wgpu::WgpuAccelerator` (feature `wgpu`) compiles the WGSL kernels,
//!   specialised by the option defines, and runs them on a GPU.

pub mod host;
#[cfg(any(feature = "wgpu", feature = "cuda"))]
pub mod wgpu;

use crate::activation::ActivationFunction;
use crate::error::DeviceFault;
use crate::kernels::KernelSource;
use core::fmt;
use std::sync::Arc;

/// Identifies a kernel built by an accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(pub(crate) usize);

/// Identifies a buffer allocated on an accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceBufferId(pub(crate) usize);

/// One positional argument of a kernel dispatch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceArg {
    /// A 32-bit signed scalar.
    Int(i32),
    /// A 32-bit float scalar.
    Float(f32),
    /// A device buffer.
    Buffer(DeviceBufferId),
    /// Per-work-group scratch space of the given element count.
    Local(usize),
}

/// Build-time options of a kernel: valued defines, flags and the activation.
///
/// Rendered with [`Display`](fmt::Display) as `-D name=value` / `-D FLAG`,
/// the same string that identifies a specialised kernel.
#[derive(Clone, Default)]
pub struct KernelOptions {
    values: Vec<(String, usize)>,
    flags: Vec<String>,
    activation: Option<Arc<dyn ActivationFunction>>,
}

impl KernelOptions {
    /// Empty option set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a valued define.
    pub fn define(&mut self, name: &str, value: usize) -> &mut Self {
        match self.values.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name.to_owned(), value)),
        }
        self
    }

    /// Adds a valueless define.
    pub fn flag(&mut self, name: &str) -> &mut Self {
        if !self.flags.iter().any(|f| f == name) {
            self.flags.push(name.to_owned());
        }
        self
    }

    /// Attaches the activation function and its define flag.
    pub fn activation(&mut self, activation: Arc<dyn ActivationFunction>) -> &mut Self {
        self.flag(activation.define_name());
        self.activation = Some(activation);
        self
    }

    /// Value of a define, if present.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<usize> {
        self.values
            .iter()
            .find_map(|(n, v)| (n == name).then_some(*v))
    }

    /// Whether a valueless define is present.
    #[must_use]
    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.iter().any(|f| f == name)
    }

    /// Valued defines in insertion order.
    pub fn values(&self) -> impl Iterator<Item = (&str, usize)> {
        self.values.iter().map(|(n, v)| (n.as_str(), *v))
    }

    /// The attached activation, if any.
    #[must_use]
    pub fn activation_function(&self) -> Option<&Arc<dyn ActivationFunction>> {
        self.activation.as_ref()
    }
}

impl fmt::Display for KernelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.values {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "-D {name}={value}")?;
            first = false;
        }
        for flag in &self.flags {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "-D {flag}")?;
            first = false;
        }
        Ok(())
    }
}

impl fmt::Debug for KernelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KernelOptions({self})")
    }
}

/// An executor of named compute kernels over flat `f32` buffers.
///
/// Every dispatch is synchronous from the caller's point of view once
/// [`Accelerator::finish`] returns. Freshly allocated buffers are zeroed.
pub trait Accelerator: Send {
    /// Short human-readable name, used in logs.
    fn name(&self) -> &str;

    /// Largest work-group size a dispatch may use.
    fn max_workgroup_size(&self) -> usize;

    /// Builds `source` specialised by `options`.
    ///
    /// # Errors
    ///
    /// [`DeviceFault::Build`] when the kernel is unknown, a define it needs is
    /// missing, or the substrate rejects the source.
    fn build_kernel(
        &mut self,
        source: &KernelSource,
        options: &KernelOptions,
    ) -> Result<KernelId, DeviceFault>;

    /// Allocates a zeroed buffer of `len` elements.
    ///
    /// # Errors
    ///
    /// [`DeviceFault::Transfer`] when the allocation fails.
    fn alloc(&mut self, len: usize) -> Result<DeviceBufferId, DeviceFault>;

    /// Copies `data` to the start of `buffer`.
    ///
    /// # Errors
    ///
    /// Unknown buffer, or more data than the buffer holds.
    fn write(&mut self, buffer: DeviceBufferId, data: &[f32]) -> Result<(), DeviceFault>;

    /// Copies the start of `buffer` into `out`.
    ///
    /// # Errors
    ///
    /// Unknown buffer, or `out` longer than the buffer.
    fn read(&mut self, buffer: DeviceBufferId, out: &mut [f32]) -> Result<(), DeviceFault>;

    /// Frees `buffer`.
    ///
    /// # Errors
    ///
    /// [`DeviceFault::UnknownBuffer`] when the buffer was never allocated or
    /// was already freed.
    fn free(&mut self, buffer: DeviceBufferId) -> Result<(), DeviceFault>;

    /// Launches `kernel` over `global_size` work items in groups of
    /// `workgroup_size`.
    ///
    /// # Errors
    ///
    /// [`DeviceFault::Dispatch`] on malformed arguments or sizes, or when the
    /// substrate fails to run the kernel.
    fn dispatch(
        &mut self,
        kernel: KernelId,
        args: &[DeviceArg],
        global_size: usize,
        workgroup_size: usize,
    ) -> Result<(), DeviceFault>;

    /// Blocks until every previously issued command has completed.
    ///
    /// # Errors
    ///
    /// [`DeviceFault::Dispatch`] when the device reports a failure.
    fn finish(&mut self) -> Result<(), DeviceFault>;
}

/// Work-group size for `total` items: the device maximum, or fewer when the
/// whole job is smaller.
#[inline]
#[must_use]
pub fn workgroup_size_for(total: usize, max_workgroup_size: usize) -> usize {
    total.clamp(1, max_workgroup_size.max(1))
}

/// Rounds `total` up to a multiple of `workgroup_size`.
#[inline]
#[must_use]
pub const fn round_up(total: usize, workgroup_size: usize) -> usize {
    total.div_ceil(workgroup_size) * workgroup_size
}

//! Backend selection module.
//!
//! This module defines the available computation backends and a global
//! switch between them. A [`Context`] created with
//! [`Context::from_backend`] tries the requested backend first and falls back
//! to the host accelerator:
//!
//! 1. `Cuda` (placeholder, routed to WGPU when that feature is compiled in)
//! 2. `Wgpu` (feature `wgpu`)
//! 3. `Cpu`, the host accelerator
//!
//! The backend is stored globally using an `AtomicU8`, so switching is cheap
//! and needs no locking.

use crate::accel::host::HostAccelerator;
use crate::sync::Context;
use core::convert::TryFrom;
use core::sync::atomic::{AtomicU8, Ordering};
use tracing::debug;

/// Enumeration of supported computation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Backend {
    /// Host accelerator on the CPU (default).
    #[default]
    Cpu = 0,
    /// GPU accelerator using `wgpu`.
    Wgpu,
    /// Placeholder for CUDA; served by `wgpu` when available.
    Cuda,
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Wgpu),
            2 => Ok(Self::Cuda),
            _ => Err(()),
        }
    }
}

static GLOBAL_DEFAULT_BACKEND: AtomicU8 = AtomicU8::new(Backend::Cpu as u8);

/// Sets the backend new contexts are created with.
///
/// # Example
///
/// ```
/// use briny_conv::backend::{get_backend, set_backend, Backend};
/// set_backend(Backend::Wgpu);
/// assert_eq!(get_backend(), Backend::Wgpu);
/// set_backend(Backend::Cpu);
/// ```
pub fn set_backend(b: Backend) {
    GLOBAL_DEFAULT_BACKEND.store(b as u8, Ordering::Release);
}

/// Returns the currently selected backend.
///
/// If the stored value is invalid, defaults to [`Backend::Cpu`].
#[must_use]
pub fn get_backend() -> Backend {
    Backend::try_from(GLOBAL_DEFAULT_BACKEND.load(Ordering::Acquire)).unwrap_or_default()
}

impl Context {
    /// Context over the accelerator for `backend`, or the host accelerator
    /// when that backend is not compiled in or no device is present.
    #[must_use]
    pub fn from_backend(backend: Backend) -> Self {
        match backend {
            Backend::Cuda | Backend::Wgpu => {
                #[cfg(any(feature = "wgpu", feature = "cuda"))]
                {
                    match crate::accel::wgpu::WgpuAccelerator::new() {
                        Ok(accel) => return Self::new(Box::new(accel)),
                        Err(e) => {
                            tracing::warn!(?backend, error = %e, "falling back to host accelerator");
                        }
                    }
                }
                #[cfg(not(any(feature = "wgpu", feature = "cuda")))]
                tracing::warn!(?backend, "backend not compiled in; using host accelerator");
            }
            Backend::Cpu => {}
        }
        debug!("using host accelerator");
        Self::new(Box::new(HostAccelerator::new()))
    }

    /// [`from_backend`](Self::from_backend) with [`get_backend`].
    #[must_use]
    pub fn from_global_backend() -> Self {
        Self::from_backend(get_backend())
    }
}

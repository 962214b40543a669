//! Error taxonomy for the convolution engine.
//!
//! Two families exist:
//!
//! - configuration errors, raised while a layer is being built so that no
//!   layer ever exists in an invalid shape;
//! - device faults, raised by an [`Accelerator`](crate::accel::Accelerator)
//!   when a kernel fails to build, dispatch or transfer. These are fatal for
//!   the operation that raised them and are never retried; outputs are
//!   undefined afterwards.

use crate::sync::MirrorHandle;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, ConvError>;

/// A fault reported by the accelerator substrate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceFault {
    /// No usable adapter/device could be acquired.
    #[error("no suitable compute adapter found")]
    NoAdapter,
    /// A kernel failed to build from its source and options.
    #[error("failed to build kernel '{kernel}': {reason}")]
    Build {
        /// Kernel entry name.
        kernel: String,
        /// Reason reported by the substrate.
        reason: String,
    },
    /// A kernel dispatch was rejected or failed while running.
    #[error("failed to dispatch kernel '{kernel}': {reason}")]
    Dispatch {
        /// Kernel entry name.
        kernel: String,
        /// Reason reported by the substrate.
        reason: String,
    },
    /// A host/device copy failed.
    #[error("buffer transfer failed: {0}")]
    Transfer(String),
    /// A device buffer id that the accelerator never handed out, or already freed.
    #[error("unknown device buffer #{0}")]
    UnknownBuffer(usize),
    /// A kernel id that the accelerator never handed out.
    #[error("unknown kernel #{0}")]
    UnknownKernel(usize),
}

/// Errors raised by layers and the buffer synchronization context.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConvError {
    /// Zero-padding needs a filter with a well-defined centre.
    #[error(
        "filter size must be an odd number if zero-padding is enabled, got {filter_size}; \
         either turn off padding or choose a different filter size"
    )]
    EvenFilterWithPadding {
        /// Requested filter edge length.
        filter_size: usize,
    },
    /// The filter does not fit on the upstream board.
    #[error("filter size cannot be larger than upstream board size: {filter_size} > {upstream_board_size}")]
    FilterTooLarge {
        /// Requested filter edge length.
        filter_size: usize,
        /// Edge length of the upstream board.
        upstream_board_size: usize,
    },
    /// Any other invalid shape or size request.
    #[error("invalid layer configuration: {0}")]
    InvalidConfig(String),
    /// A caller-supplied buffer has the wrong element count.
    #[error("length mismatch for {what}: expected {expected}, got {got}")]
    LengthMismatch {
        /// What the buffer holds.
        what: &'static str,
        /// Expected element count.
        expected: usize,
        /// Supplied element count.
        got: usize,
    },
    /// The mirror handle is not (or no longer) bound.
    #[error("unknown mirror {0:?}")]
    UnknownMirror(MirrorHandle),
    /// A kernel was asked to read a mirror whose host copy is newer than its device copy.
    #[error("device copy of {0:?} is stale; push it before dispatching")]
    StaleDeviceCopy(MirrorHandle),
    /// Fatal accelerator fault.
    #[error(transparent)]
    Device(#[from] DeviceFault),
}

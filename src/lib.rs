//! # `briny_conv`
//!
//! A convolutional-layer engine: forward activations, weight and bias
//! gradients and upstream error propagation for a 2D convolution, executed
//! by named compute kernels on an accelerator or on the host.
//!
//! ## Features
//!
//! - **Dimension model**: validated layer shapes and flat-index arithmetic
//! - **Mirrored buffers**: host arrays paired with device buffers, moved
//!   across only when the other side is stale
//! - **Three weight-gradient strategies**: naive, scratch and
//!   scratch with fused bias, picked by filter size
//! - **Accelerators**: a `rayon` host accelerator and an optional
//!   `wgpu`-powered GPU accelerator running the same WGSL kernels
//! - **Reference**: plain nested-loop implementations for verification
//!
//! ## Modules
//!
//! - [`dims`]: layer shapes and index arithmetic
//! - [`sync`]: the [`Context`](sync::Context) and its mirrors
//! - [`accel`]: the accelerator substrate
//! - [`kernels`]: kernel sources
//! - [`conv`]: the convolutional layer
//! - [`layer`]: the upstream capability and input boards
//! - [`activation`], [`loss`]: pluggable capabilities
//! - [`backend`]: global backend selection
//!
//! ## Example
//!
//! ```
//! use briny_conv::activation::Linear;
//! use briny_conv::conv::ConvLayerConfig;
//! use briny_conv::layer::InputLayer;
//! use briny_conv::sync::Context;
//! use std::sync::Arc;
//!
//! let mut ctx = Context::host();
//! let mut input = InputLayer::new(1, 8).unwrap();
//! input.set_input(&[1.0; 64]).unwrap();
//!
//! let mut conv = ConvLayerConfig::default()
//!     .num_filters(2)
//!     .activation(Arc::new(Linear))
//!     .build(&mut ctx, &input)
//!     .unwrap();
//! conv.set_weights(&mut ctx, &[0.1; 18], &[0.0; 2]).unwrap();
//! conv.set_batch_size(&mut ctx, 1).unwrap();
//! conv.forward(&mut ctx, &input).unwrap();
//! assert!(conv.output(&mut ctx).unwrap().iter().all(|v| (v - 0.9).abs() < 1e-5));
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::similar_names,
    clippy::too_many_arguments,
    clippy::module_name_repetitions
)]
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod accel;
pub mod activation;
pub mod approx;
pub mod backend;
pub mod conv;
pub mod dims;
pub mod error;
pub mod kernels;
pub mod layer;
pub mod loss;
pub mod sync;

pub use backend::{get_backend, set_backend, Backend};
pub use conv::{ConvLayer, ConvLayerConfig};
pub use dims::LayerDimensions;
pub use error::{ConvError, DeviceFault, Result};
pub use sync::Context;

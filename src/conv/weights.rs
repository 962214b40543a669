//! Weight-gradient strategies.
//!
//! Three interchangeable implementations of one contract: given output
//! errors and upstream activations, write
//!
//! ```text
//! delta(f, p, u, v) = -lr / (batch · outBoard²)
//!     · Σ_{n, row, col} upstream(n, p, row - margin + u, col - margin + v)
//!                       · activation'(output(n, f, row, col)) · error(n, f, row, col)
//! ```
//!
//! into the weight-change mirror. [`select_strategy`] picks one from the
//! filter size alone.

use super::LayerKernels;
use crate::accel::{round_up, workgroup_size_for};
use crate::dims::LayerDimensions;
use crate::error::Result;
use crate::sync::{Context, KernelArg, MirrorHandle};
use core::fmt;

/// Largest filter size handled by the scratch kernels.
pub const SCRATCH_MAX_FILTER_SIZE: usize = 19;

/// `learning_rate / (batch_size · outputBoardSize²)`.
#[must_use]
pub fn learning_multiplier(dims: &LayerDimensions, batch_size: usize, learning_rate: f32) -> f32 {
    learning_rate / (batch_size * dims.output_board_size_squared()) as f32
}

/// Everything a gradient dispatch reads and writes.
#[derive(Debug, Clone, Copy)]
pub struct GradientPass<'a> {
    pub(crate) dims: &'a LayerDimensions,
    pub(crate) kernels: &'a LayerKernels,
    pub(crate) batch_size: i32,
    pub(crate) learning_multiplier: f32,
    pub(crate) images: MirrorHandle,
    pub(crate) output: MirrorHandle,
    pub(crate) errors: MirrorHandle,
    pub(crate) weight_changes: MirrorHandle,
    pub(crate) bias_changes: MirrorHandle,
}

/// One way of computing the weight gradient.
pub trait WeightGradient: fmt::Debug + Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Whether the bias gradient comes out of the same dispatch.
    fn computes_bias(&self) -> bool {
        false
    }

    /// Fills `pass.weight_changes` (and `pass.bias_changes` when
    /// [`computes_bias`](Self::computes_bias)).
    ///
    /// # Errors
    ///
    /// Device faults from the dispatch.
    fn compute(&self, ctx: &mut Context, pass: &GradientPass<'_>) -> Result<()>;
}

/// One work item per weight, each summing over the whole batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Naive;

/// One work-group per `(outPlane, inputPlane)` pair, boards staged in
/// scratch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scratch;

/// [`Scratch`] that also produces the bias gradient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScratchWithBias;

impl WeightGradient for Naive {
    fn name(&self) -> &'static str {
        "naive"
    }

    fn compute(&self, ctx: &mut Context, pass: &GradientPass<'_>) -> Result<()> {
        let total = pass.dims.weights_size();
        let workgroup_size = workgroup_size_for(total, ctx.max_workgroup_size());
        ctx.dispatch(
            pass.kernels.backprop_weights,
            &[
                KernelArg::Int(pass.batch_size),
                KernelArg::Float(pass.learning_multiplier),
                KernelArg::Input(pass.images),
                KernelArg::Input(pass.output),
                KernelArg::Input(pass.errors),
                KernelArg::Output(pass.weight_changes),
            ],
            round_up(total, workgroup_size),
            workgroup_size,
        )
    }
}

/// Work-group and scratch layout shared by both scratch strategies.
fn scratch_geometry(dims: &LayerDimensions) -> (usize, usize, [KernelArg; 3]) {
    let workgroup_size = dims.filter_size_squared();
    let groups = dims.num_filters() * dims.input_planes();
    let locals = [
        KernelArg::Local(dims.input_board_size_squared()),
        KernelArg::Local(dims.output_board_size_squared()),
        KernelArg::Local(dims.output_board_size_squared()),
    ];
    (groups * workgroup_size, workgroup_size, locals)
}

impl WeightGradient for Scratch {
    fn name(&self) -> &'static str {
        "scratch"
    }

    fn compute(&self, ctx: &mut Context, pass: &GradientPass<'_>) -> Result<()> {
        let (global_size, workgroup_size, [a, b, c]) = scratch_geometry(pass.dims);
        ctx.dispatch(
            pass.kernels.backprop_weights_scratch,
            &[
                KernelArg::Int(pass.batch_size),
                KernelArg::Float(pass.learning_multiplier),
                KernelArg::Input(pass.images),
                KernelArg::Input(pass.output),
                KernelArg::Input(pass.errors),
                KernelArg::Output(pass.weight_changes),
                a,
                b,
                c,
            ],
            global_size,
            workgroup_size,
        )
    }
}

impl WeightGradient for ScratchWithBias {
    fn name(&self) -> &'static str {
        "scratch+bias"
    }

    fn computes_bias(&self) -> bool {
        true
    }

    fn compute(&self, ctx: &mut Context, pass: &GradientPass<'_>) -> Result<()> {
        let (global_size, workgroup_size, [a, b, c]) = scratch_geometry(pass.dims);
        ctx.dispatch(
            pass.kernels.backprop_weights_scratch_bias,
            &[
                KernelArg::Int(pass.batch_size),
                KernelArg::Float(pass.learning_multiplier),
                KernelArg::Input(pass.images),
                KernelArg::Input(pass.output),
                KernelArg::Input(pass.errors),
                KernelArg::Output(pass.weight_changes),
                KernelArg::Output(pass.bias_changes),
                a,
                b,
                c,
            ],
            global_size,
            workgroup_size,
        )
    }
}

/// Fused scratch kernel up to [`SCRATCH_MAX_FILTER_SIZE`], naive beyond.
#[must_use]
pub fn select_strategy(filter_size: usize) -> &'static dyn WeightGradient {
    if filter_size <= SCRATCH_MAX_FILTER_SIZE {
        &ScratchWithBias
    } else {
        &Naive
    }
}

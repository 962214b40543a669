//! Standalone bias gradient.

use super::weights::GradientPass;
use crate::accel::{round_up, workgroup_size_for};
use crate::error::Result;
use crate::sync::{Context, KernelArg};

/// `biasDelta(f) = -multiplier · Σ activation'(output) · error` over the
/// batch and the board of plane `f`. Returns at once for unbiased layers.
pub(crate) fn backprop_bias(ctx: &mut Context, pass: &GradientPass<'_>) -> Result<()> {
    if !pass.dims.biased() {
        return Ok(());
    }
    let planes = pass.dims.num_filters();
    let workgroup_size = workgroup_size_for(planes, ctx.max_workgroup_size());
    ctx.dispatch(
        pass.kernels.backprop_bias,
        &[
            KernelArg::Float(pass.learning_multiplier),
            KernelArg::Int(pass.batch_size),
            KernelArg::Input(pass.output),
            KernelArg::Input(pass.errors),
            KernelArg::Output(pass.bias_changes),
        ],
        round_up(planes, workgroup_size),
        workgroup_size,
    )
}

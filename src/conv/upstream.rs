//! Error propagation to the upstream stage.

use super::kernel_int;
use crate::accel::{round_up, workgroup_size_for, KernelId};
use crate::dims::LayerDimensions;
use crate::error::Result;
use crate::sync::{Context, KernelArg, MirrorHandle};

/// Transposed convolution of `errors` against `weights`, one work item per
/// upstream cell, written into `errors_for_upstream`.
pub(crate) fn calc_errors_for_upstream(
    ctx: &mut Context,
    kernel: KernelId,
    dims: &LayerDimensions,
    batch_size: usize,
    weights: MirrorHandle,
    errors: MirrorHandle,
    errors_for_upstream: MirrorHandle,
) -> Result<()> {
    let total = batch_size * dims.input_cube_size();
    let workgroup_size = workgroup_size_for(total, ctx.max_workgroup_size());
    ctx.dispatch(
        kernel,
        &[
            KernelArg::Int(kernel_int(batch_size)?),
            KernelArg::Input(weights),
            KernelArg::Input(errors),
            KernelArg::Output(errors_for_upstream),
        ],
        round_up(total, workgroup_size),
        workgroup_size,
    )
}

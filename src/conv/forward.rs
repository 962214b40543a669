//! Forward convolution dispatch.

use super::kernel_int;
use crate::accel::{round_up, workgroup_size_for, KernelId};
use crate::dims::LayerDimensions;
use crate::error::Result;
use crate::sync::{Context, KernelArg, MirrorHandle};
use tracing::trace;

/// Buffers of one forward dispatch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ForwardPass {
    pub(crate) batch_size: usize,
    pub(crate) images: MirrorHandle,
    pub(crate) weights: MirrorHandle,
    pub(crate) bias: MirrorHandle,
    pub(crate) output: MirrorHandle,
}

/// One work item per output cell, in groups as large as the device allows.
pub(crate) fn propagate(
    ctx: &mut Context,
    kernel: KernelId,
    dims: &LayerDimensions,
    pass: &ForwardPass,
) -> Result<()> {
    let total = pass.batch_size * dims.output_cube_size();
    let workgroup_size = workgroup_size_for(total, ctx.max_workgroup_size());
    let global_size = round_up(total, workgroup_size);
    trace!(total, global_size, workgroup_size, "convolve");
    ctx.dispatch(
        kernel,
        &[
            KernelArg::Int(kernel_int(pass.batch_size)?),
            KernelArg::Input(pass.images),
            KernelArg::Input(pass.weights),
            KernelArg::Input(pass.bias),
            KernelArg::Output(pass.output),
        ],
        global_size,
        workgroup_size,
    )
}

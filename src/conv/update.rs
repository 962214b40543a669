//! Weight update, the only mutator of trained parameters.

use super::kernel_int;
use crate::accel::{round_up, workgroup_size_for, KernelId};
use crate::error::Result;
use crate::sync::{Context, KernelArg, MirrorHandle};

/// `values[i] += deltas[i]` on the device for the first `len` elements.
pub(crate) fn add_in_place(
    ctx: &mut Context,
    kernel: KernelId,
    deltas: MirrorHandle,
    values: MirrorHandle,
    len: usize,
) -> Result<()> {
    let workgroup_size = workgroup_size_for(len, ctx.max_workgroup_size());
    ctx.dispatch(
        kernel,
        &[KernelArg::Int(kernel_int(len)?), KernelArg::Input(deltas), KernelArg::Output(values)],
        round_up(len, workgroup_size),
        workgroup_size,
    )
}

/// `values[i] += deltas[i]` on the host copy; it is pushed before the next
/// dispatch that reads it.
pub(crate) fn add_on_host(ctx: &mut Context, values: MirrorHandle, deltas: &[f32]) -> Result<()> {
    for (v, d) in ctx.host_mut(values)?.iter_mut().zip(deltas) {
        *v += d;
    }
    Ok(())
}

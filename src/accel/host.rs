//! Host accelerator.
//!
//! Executes the named kernels on the CPU. Every kernel is written per work
//! item, the way the device kernels are, and parallelised with `rayon`.
//! Work-group semantics are honoured: the global size must be a whole number
//! of groups, scratch kernels stage boards into per-group local buffers, and
//! work items beyond the logical range do nothing.

use super::{Accelerator, DeviceArg, DeviceBufferId, KernelId, KernelOptions};
use crate::activation::ActivationFunction;
use crate::dims::LayerDimensions;
use crate::error::DeviceFault;
use crate::kernels::{self, KernelSource};
use rayon::prelude::*;
use std::sync::Arc;
use tracing::trace;

/// Work-group limit of a freshly created host accelerator.
pub const DEFAULT_MAX_WORKGROUP_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostOp {
    Convolve,
    BackpropWeights,
    BackpropWeightsScratch { fused_bias: bool },
    ErrorsForUpstream,
    BackpropBias,
    AddInPlace,
}

impl HostOp {
    fn for_kernel(name: &str) -> Option<Self> {
        Some(match name {
            n if n == kernels::CONVOLVE.name => Self::Convolve,
            n if n == kernels::BACKPROP_WEIGHTS.name => Self::BackpropWeights,
            n if n == kernels::BACKPROP_WEIGHTS_SCRATCH.name => {
                Self::BackpropWeightsScratch { fused_bias: false }
            }
            n if n == kernels::BACKPROP_WEIGHTS_SCRATCH_BIAS.name => {
                Self::BackpropWeightsScratch { fused_bias: true }
            }
            n if n == kernels::CALC_ERRORS_FOR_UPSTREAM.name => Self::ErrorsForUpstream,
            n if n == kernels::BACKPROP_BIAS.name => Self::BackpropBias,
            n if n == kernels::ADD_IN_PLACE.name => Self::AddInPlace,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
struct HostKernel {
    name: &'static str,
    op: HostOp,
    dims: Option<LayerDimensions>,
    activation: Option<Arc<dyn ActivationFunction>>,
}

impl HostKernel {
    fn dims(&self) -> Result<&LayerDimensions, DeviceFault> {
        self.dims
            .as_ref()
            .ok_or_else(|| fault(self.name, "kernel built without shape defines"))
    }

    fn activation(&self) -> Result<&dyn ActivationFunction, DeviceFault> {
        self.activation
            .as_deref()
            .ok_or_else(|| fault(self.name, "kernel built without an activation"))
    }
}

/// CPU executor of the named kernels.
#[derive(Debug)]
pub struct HostAccelerator {
    max_workgroup_size: usize,
    buffers: Vec<Option<Vec<f32>>>,
    kernels: Vec<HostKernel>,
}

impl Default for HostAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

impl HostAccelerator {
    /// Host accelerator with [`DEFAULT_MAX_WORKGROUP_SIZE`].
    #[must_use]
    pub const fn new() -> Self {
        Self::with_max_workgroup_size(DEFAULT_MAX_WORKGROUP_SIZE)
    }

    /// Host accelerator emulating a device with a smaller or larger
    /// work-group limit.
    #[must_use]
    pub const fn with_max_workgroup_size(max_workgroup_size: usize) -> Self {
        Self {
            max_workgroup_size: if max_workgroup_size == 0 { 1 } else { max_workgroup_size },
            buffers: Vec::new(),
            kernels: Vec::new(),
        }
    }

    /// Number of buffers currently allocated.
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_some()).count()
    }

    fn buffer(&self, id: DeviceBufferId) -> Result<&[f32], DeviceFault> {
        self.buffers
            .get(id.0)
            .and_then(Option::as_deref)
            .ok_or(DeviceFault::UnknownBuffer(id.0))
    }

    fn take(&mut self, id: DeviceBufferId) -> Result<Vec<f32>, DeviceFault> {
        self.buffers
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(DeviceFault::UnknownBuffer(id.0))
    }

    fn restore(&mut self, id: DeviceBufferId, data: Vec<f32>) {
        if let Some(slot) = self.buffers.get_mut(id.0) {
            *slot = Some(data);
        }
    }

    /// Runs `body` with the buffer `id` taken out for writing.
    fn with_output<R>(
        &mut self,
        id: DeviceBufferId,
        body: impl FnOnce(&Self, &mut [f32]) -> Result<R, DeviceFault>,
    ) -> Result<R, DeviceFault> {
        let mut out = self.take(id)?;
        let result = body(self, &mut out);
        self.restore(id, out);
        result
    }
}

fn fault(kernel: &str, reason: impl Into<String>) -> DeviceFault {
    DeviceFault::Dispatch {
        kernel: kernel.to_owned(),
        reason: reason.into(),
    }
}

fn dims_from_options(
    source: &KernelSource,
    options: &KernelOptions,
) -> Result<Option<LayerDimensions>, DeviceFault> {
    if source.defines.is_empty() {
        return Ok(None);
    }
    let value = |name: &str| {
        options
            .value(name)
            .ok_or_else(|| source.build_fault(format!("missing define {name}")))
    };
    let dims = LayerDimensions::new(
        value("gUpstreamNumPlanes")?,
        value("gUpstreamBoardSize")?,
        value("gNumOutPlanes")?,
        value("gFilterSize")?,
        value("gPadZeros")? != 0,
        value("gBiased")? != 0,
    )
    .map_err(|e| source.build_fault(e.to_string()))?;
    if value("gOutBoardSize")? != dims.output_board_size() || value("gMargin")? != dims.margin() {
        return Err(source.build_fault("inconsistent shape defines".into()));
    }
    Ok(Some(dims))
}

/// Positional view over dispatch arguments with typed accessors.
struct Args<'a> {
    kernel: &'static str,
    args: &'a [DeviceArg],
}

impl Args<'_> {
    fn expect_len(&self, len: usize) -> Result<(), DeviceFault> {
        if self.args.len() == len {
            Ok(())
        } else {
            Err(fault(
                self.kernel,
                format!("expected {len} arguments, got {}", self.args.len()),
            ))
        }
    }

    fn count(&self, i: usize) -> Result<usize, DeviceFault> {
        match self.args.get(i) {
            Some(&DeviceArg::Int(v)) => usize::try_from(v)
                .map_err(|_| fault(self.kernel, format!("argument {i} is negative"))),
            _ => Err(fault(self.kernel, format!("argument {i} must be an int"))),
        }
    }

    fn float(&self, i: usize) -> Result<f32, DeviceFault> {
        match self.args.get(i) {
            Some(&DeviceArg::Float(v)) => Ok(v),
            _ => Err(fault(self.kernel, format!("argument {i} must be a float"))),
        }
    }

    fn buffer(&self, i: usize) -> Result<DeviceBufferId, DeviceFault> {
        match self.args.get(i) {
            Some(&DeviceArg::Buffer(b)) => Ok(b),
            _ => Err(fault(self.kernel, format!("argument {i} must be a buffer"))),
        }
    }

    fn local(&self, i: usize) -> Result<usize, DeviceFault> {
        match self.args.get(i) {
            Some(&DeviceArg::Local(len)) => Ok(len),
            _ => Err(fault(self.kernel, format!("argument {i} must be local scratch"))),
        }
    }

    fn check_distinct_buffers(&self) -> Result<(), DeviceFault> {
        let ids: Vec<_> = self
            .args
            .iter()
            .filter_map(|a| match a {
                DeviceArg::Buffer(b) => Some(*b),
                _ => None,
            })
            .collect();
        for (i, a) in ids.iter().enumerate() {
            if ids[i + 1..].contains(a) {
                return Err(fault(self.kernel, format!("buffer #{} bound twice", a.0)));
            }
        }
        Ok(())
    }
}

fn require(kernel: &str, what: &str, buf: &[f32], len: usize) -> Result<(), DeviceFault> {
    if buf.len() < len {
        return Err(fault(
            kernel,
            format!("{what} holds {} elements, needs {len}", buf.len()),
        ));
    }
    Ok(())
}

fn convolve_cell(
    dims: &LayerDimensions,
    activation: &dyn ActivationFunction,
    images: &[f32],
    filters: &[f32],
    biases: &[f32],
    global_id: usize,
) -> f32 {
    let out_cube = dims.output_cube_size();
    let n = global_id / out_cube;
    let out_plane = (global_id % out_cube) / dims.output_board_size_squared();
    let out_pos = global_id % dims.output_board_size_squared();
    let (out_row, out_col) = (
        out_pos / dims.output_board_size(),
        out_pos % dims.output_board_size(),
    );

    let mut sum = 0.0;
    for in_plane in 0..dims.input_planes() {
        for u in 0..dims.filter_size() {
            let Some(in_row) = dims.upstream_coord(out_row, u) else {
                continue;
            };
            for v in 0..dims.filter_size() {
                let Some(in_col) = dims.upstream_coord(out_col, v) else {
                    continue;
                };
                sum += images[dims.input_index(n, in_plane, in_row, in_col)]
                    * filters[dims.weight_index(out_plane, in_plane, u, v)];
            }
        }
    }
    if dims.biased() {
        sum += biases[out_plane];
    }
    activation.value(sum)
}

fn weight_change(
    dims: &LayerDimensions,
    activation: &dyn ActivationFunction,
    batch_size: usize,
    images: &[f32],
    results: &[f32],
    errors: &[f32],
    global_id: usize,
) -> f32 {
    let per_filter = dims.input_planes() * dims.filter_size_squared();
    let out_plane = global_id / per_filter;
    let in_plane = (global_id / dims.filter_size_squared()) % dims.input_planes();
    let filter_row = (global_id % dims.filter_size_squared()) / dims.filter_size();
    let filter_col = global_id % dims.filter_size();

    let mut thiswchange = 0.0;
    for n in 0..batch_size {
        for out_row in 0..dims.output_board_size() {
            let Some(upstream_row) = dims.upstream_coord(out_row, filter_row) else {
                continue;
            };
            for out_col in 0..dims.output_board_size() {
                let Some(upstream_col) = dims.upstream_coord(out_col, filter_col) else {
                    continue;
                };
                let result_index = dims.output_index(n, out_plane, out_row, out_col);
                thiswchange += images[dims.input_index(n, in_plane, upstream_row, upstream_col)]
                    * activation.derivative(results[result_index])
                    * errors[result_index];
            }
        }
    }
    thiswchange
}

fn upstream_error(dims: &LayerDimensions, weights: &[f32], errors: &[f32], global_id: usize) -> f32 {
    let board = dims.input_board_size();
    let upstream_cube = dims.input_cube_size();
    let n = global_id / upstream_cube;
    let upstream_plane = (global_id % upstream_cube) / dims.input_board_size_squared();
    let upstream_row = (global_id % dims.input_board_size_squared()) / board;
    let upstream_col = global_id % board;

    // clip filter positions to those landing on the output board
    let margin = dims.margin();
    let last_out = dims.output_board_size() - 1;
    let filter_range = |upstream: usize| {
        let lo = (upstream + margin).saturating_sub(last_out);
        let hi = (dims.filter_size() - 1).min(upstream + margin);
        lo..=hi
    };

    let mut sum_weight_times_out_error = 0.0;
    for out_plane in 0..dims.num_filters() {
        for filter_row in filter_range(upstream_row) {
            let out_row = upstream_row + margin - filter_row;
            for filter_col in filter_range(upstream_col) {
                let out_col = upstream_col + margin - filter_col;
                sum_weight_times_out_error += weights
                    [dims.weight_index(out_plane, upstream_plane, filter_row, filter_col)]
                    * errors[dims.output_index(n, out_plane, out_row, out_col)];
            }
        }
    }
    sum_weight_times_out_error
}

fn bias_change(
    dims: &LayerDimensions,
    activation: &dyn ActivationFunction,
    batch_size: usize,
    results: &[f32],
    errors: &[f32],
    out_plane: usize,
) -> f32 {
    let mut thiswchange = 0.0;
    for n in 0..batch_size {
        let base = dims.output_index(n, out_plane, 0, 0);
        for i in base..base + dims.output_board_size_squared() {
            thiswchange += activation.derivative(results[i]) * errors[i];
        }
    }
    thiswchange
}

/// Scratch boards of one work-group.
struct Scratch {
    upstream: Vec<f32>,
    results: Vec<f32>,
    errors: Vec<f32>,
}

/// One work-group of the scratch weight gradient: `(out_plane, in_plane)`
/// pair `group`, work items `0..active` each owning one filter cell.
#[allow(clippy::too_many_arguments)]
fn scratch_group(
    dims: &LayerDimensions,
    activation: &dyn ActivationFunction,
    batch_size: usize,
    images: &[f32],
    results: &[f32],
    errors: &[f32],
    scratch: &mut Scratch,
    group: usize,
    acc: &mut [f32],
    sums_bias: bool,
) -> f32 {
    let out_plane = group / dims.input_planes();
    let in_plane = group % dims.input_planes();
    let up_sq = dims.input_board_size_squared();
    let out_sq = dims.output_board_size_squared();
    let fs = dims.filter_size();

    let mut thisbiaschange = 0.0;
    for n in 0..batch_size {
        let upstream_base = dims.input_index(n, in_plane, 0, 0);
        scratch.upstream[..up_sq].copy_from_slice(&images[upstream_base..upstream_base + up_sq]);
        let result_base = dims.output_index(n, out_plane, 0, 0);
        scratch.results[..out_sq].copy_from_slice(&results[result_base..result_base + out_sq]);
        scratch.errors[..out_sq].copy_from_slice(&errors[result_base..result_base + out_sq]);

        for (local_id, slot) in acc.iter_mut().enumerate() {
            let (filter_row, filter_col) = (local_id / fs, local_id % fs);
            for out_row in 0..dims.output_board_size() {
                let upstream_row = dims.upstream_coord(out_row, filter_row);
                for out_col in 0..dims.output_board_size() {
                    let out_index = out_row * dims.output_board_size() + out_col;
                    let delta =
                        activation.derivative(scratch.results[out_index]) * scratch.errors[out_index];
                    if sums_bias && local_id == 0 {
                        thisbiaschange += delta;
                    }
                    let (Some(r), Some(c)) = (upstream_row, dims.upstream_coord(out_col, filter_col))
                    else {
                        continue;
                    };
                    *slot += scratch.upstream[r * dims.input_board_size() + c] * delta;
                }
            }
        }
    }
    thisbiaschange
}

impl HostAccelerator {
    fn run(
        &mut self,
        kernel: &HostKernel,
        args: &Args<'_>,
        global_size: usize,
        workgroup_size: usize,
    ) -> Result<(), DeviceFault> {
        let name = kernel.name;
        match kernel.op {
            HostOp::Convolve => {
                args.expect_len(5)?;
                let dims = *kernel.dims()?;
                let activation = kernel.activation()?;
                let batch = args.count(0)?;
                let total = batch * dims.output_cube_size();
                let limit = total.min(global_size);
                let (images, filters, biases) = (args.buffer(1)?, args.buffer(2)?, args.buffer(3)?);
                self.with_output(args.buffer(4)?, |this, results| {
                    let images = this.buffer(images)?;
                    let filters = this.buffer(filters)?;
                    let biases = this.buffer(biases)?;
                    require(name, "images", images, batch * dims.input_cube_size())?;
                    require(name, "filters", filters, dims.weights_size())?;
                    require(name, "biases", biases, dims.bias_size())?;
                    require(name, "results", results, total)?;
                    results[..limit].par_iter_mut().enumerate().for_each(|(i, out)| {
                        *out = convolve_cell(&dims, activation, images, filters, biases, i);
                    });
                    Ok(())
                })
            }
            HostOp::BackpropWeights => {
                args.expect_len(6)?;
                let dims = *kernel.dims()?;
                let activation = kernel.activation()?;
                let batch = args.count(0)?;
                let multiplier = args.float(1)?;
                let limit = dims.weights_size().min(global_size);
                let (images, results, errors) = (args.buffer(2)?, args.buffer(3)?, args.buffer(4)?);
                self.with_output(args.buffer(5)?, |this, changes| {
                    let images = this.buffer(images)?;
                    let results = this.buffer(results)?;
                    let errors = this.buffer(errors)?;
                    require(name, "images", images, batch * dims.input_cube_size())?;
                    require(name, "results", results, batch * dims.output_cube_size())?;
                    require(name, "errors", errors, batch * dims.output_cube_size())?;
                    require(name, "weight changes", changes, dims.weights_size())?;
                    changes[..limit].par_iter_mut().enumerate().for_each(|(i, out)| {
                        *out = -multiplier
                            * weight_change(&dims, activation, batch, images, results, errors, i);
                    });
                    Ok(())
                })
            }
            HostOp::BackpropWeightsScratch { fused_bias } => {
                let base = if fused_bias { 7 } else { 6 };
                args.expect_len(base + 3)?;
                let dims = *kernel.dims()?;
                let activation = kernel.activation()?;
                let batch = args.count(0)?;
                let multiplier = args.float(1)?;
                let locals = (args.local(base)?, args.local(base + 1)?, args.local(base + 2)?);
                if locals.0 < dims.input_board_size_squared()
                    || locals.1 < dims.output_board_size_squared()
                    || locals.2 < dims.output_board_size_squared()
                {
                    return Err(fault(name, "local scratch smaller than the staged boards"));
                }
                let fs_sq = dims.filter_size_squared();
                let pairs = dims.num_filters() * dims.input_planes();
                let groups = (global_size / workgroup_size).min(pairs);
                let active = workgroup_size.min(fs_sq);
                let (images, results, errors) = (args.buffer(2)?, args.buffer(3)?, args.buffer(4)?);

                let mut bias_changes = if fused_bias {
                    Some((args.buffer(6)?, self.take(args.buffer(6)?)?))
                } else {
                    None
                };
                let outcome = self.with_output(args.buffer(5)?, |this, changes| {
                    let images = this.buffer(images)?;
                    let results = this.buffer(results)?;
                    let errors = this.buffer(errors)?;
                    require(name, "images", images, batch * dims.input_cube_size())?;
                    require(name, "results", results, batch * dims.output_cube_size())?;
                    require(name, "errors", errors, batch * dims.output_cube_size())?;
                    require(name, "weight changes", changes, dims.weights_size())?;
                    if let Some((_, bias)) = &bias_changes {
                        require(name, "bias changes", bias, dims.bias_size())?;
                    }

                    let bias_sums: Vec<Option<(usize, f32)>> = changes[..groups * fs_sq]
                        .par_chunks_mut(fs_sq)
                        .enumerate()
                        .map(|(group, cells)| {
                            let mut scratch = Scratch {
                                upstream: vec![0.0; locals.0],
                                results: vec![0.0; locals.1],
                                errors: vec![0.0; locals.2],
                            };
                            let mut acc = vec![0.0_f32; active];
                            let sums_bias =
                                fused_bias && dims.biased() && group % dims.input_planes() == 0;
                            let bias = scratch_group(
                                &dims,
                                activation,
                                batch,
                                images,
                                results,
                                errors,
                                &mut scratch,
                                group,
                                &mut acc,
                                sums_bias,
                            );
                            for (cell, sum) in cells.iter_mut().zip(&acc) {
                                *cell = -multiplier * sum;
                            }
                            sums_bias.then_some((group / dims.input_planes(), -multiplier * bias))
                        })
                        .collect();

                    if let Some((_, bias)) = bias_changes.as_mut() {
                        for (out_plane, change) in bias_sums.into_iter().flatten() {
                            bias[out_plane] = change;
                        }
                    }
                    Ok(())
                });
                if let Some((id, bias)) = bias_changes {
                    self.restore(id, bias);
                }
                outcome
            }
            HostOp::ErrorsForUpstream => {
                args.expect_len(4)?;
                let dims = *kernel.dims()?;
                let batch = args.count(0)?;
                let total = batch * dims.input_cube_size();
                let limit = total.min(global_size);
                let (weights, errors) = (args.buffer(1)?, args.buffer(2)?);
                self.with_output(args.buffer(3)?, |this, out| {
                    let weights = this.buffer(weights)?;
                    let errors = this.buffer(errors)?;
                    require(name, "weights", weights, dims.weights_size())?;
                    require(name, "errors", errors, batch * dims.output_cube_size())?;
                    require(name, "errors for upstream", out, total)?;
                    out[..limit].par_iter_mut().enumerate().for_each(|(i, slot)| {
                        *slot = upstream_error(&dims, weights, errors, i);
                    });
                    Ok(())
                })
            }
            HostOp::BackpropBias => {
                args.expect_len(5)?;
                let dims = *kernel.dims()?;
                let activation = kernel.activation()?;
                let multiplier = args.float(0)?;
                let batch = args.count(1)?;
                let limit = dims.num_filters().min(global_size);
                let (results, errors) = (args.buffer(2)?, args.buffer(3)?);
                self.with_output(args.buffer(4)?, |this, changes| {
                    let results = this.buffer(results)?;
                    let errors = this.buffer(errors)?;
                    require(name, "results", results, batch * dims.output_cube_size())?;
                    require(name, "errors", errors, batch * dims.output_cube_size())?;
                    require(name, "bias changes", changes, dims.num_filters())?;
                    changes[..limit].par_iter_mut().enumerate().for_each(|(plane, out)| {
                        *out = -multiplier
                            * bias_change(&dims, activation, batch, results, errors, plane);
                    });
                    Ok(())
                })
            }
            HostOp::AddInPlace => {
                args.expect_len(3)?;
                let n = args.count(0)?;
                let limit = n.min(global_size);
                let deltas = args.buffer(1)?;
                self.with_output(args.buffer(2)?, |this, values| {
                    let deltas = this.buffer(deltas)?;
                    require(name, "deltas", deltas, n)?;
                    require(name, "values", values, n)?;
                    values[..limit]
                        .par_iter_mut()
                        .zip(deltas[..limit].par_iter())
                        .for_each(|(v, d)| *v += d);
                    Ok(())
                })
            }
        }
    }
}

impl Accelerator for HostAccelerator {
    fn name(&self) -> &str {
        "host"
    }

    fn max_workgroup_size(&self) -> usize {
        self.max_workgroup_size
    }

    fn build_kernel(
        &mut self,
        source: &KernelSource,
        options: &KernelOptions,
    ) -> Result<KernelId, DeviceFault> {
        let op = HostOp::for_kernel(source.name)
            .ok_or_else(|| source.build_fault("no host implementation".into()))?;
        source.check_options(options)?;
        let dims = dims_from_options(source, options)?;
        self.kernels.push(HostKernel {
            name: source.name,
            op,
            dims,
            activation: options.activation_function().cloned(),
        });
        Ok(KernelId(self.kernels.len() - 1))
    }

    fn alloc(&mut self, len: usize) -> Result<DeviceBufferId, DeviceFault> {
        let slot = self.buffers.iter().position(Option::is_none);
        let data = Some(vec![0.0; len]);
        Ok(DeviceBufferId(match slot {
            Some(i) => {
                self.buffers[i] = data;
                i
            }
            None => {
                self.buffers.push(data);
                self.buffers.len() - 1
            }
        }))
    }

    fn write(&mut self, buffer: DeviceBufferId, data: &[f32]) -> Result<(), DeviceFault> {
        let dst = self
            .buffers
            .get_mut(buffer.0)
            .and_then(Option::as_mut)
            .ok_or(DeviceFault::UnknownBuffer(buffer.0))?;
        if data.len() > dst.len() {
            return Err(DeviceFault::Transfer(format!(
                "write of {} elements into buffer #{} of {}",
                data.len(),
                buffer.0,
                dst.len()
            )));
        }
        dst[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&mut self, buffer: DeviceBufferId, out: &mut [f32]) -> Result<(), DeviceFault> {
        let src = self.buffer(buffer)?;
        if out.len() > src.len() {
            return Err(DeviceFault::Transfer(format!(
                "read of {} elements from buffer #{} of {}",
                out.len(),
                buffer.0,
                src.len()
            )));
        }
        out.copy_from_slice(&src[..out.len()]);
        Ok(())
    }

    fn free(&mut self, buffer: DeviceBufferId) -> Result<(), DeviceFault> {
        self.take(buffer).map(drop)
    }

    fn dispatch(
        &mut self,
        kernel: KernelId,
        args: &[DeviceArg],
        global_size: usize,
        workgroup_size: usize,
    ) -> Result<(), DeviceFault> {
        let host_kernel = self
            .kernels
            .get(kernel.0)
            .cloned()
            .ok_or(DeviceFault::UnknownKernel(kernel.0))?;
        let name = host_kernel.name;
        if workgroup_size == 0 || workgroup_size > self.max_workgroup_size {
            return Err(fault(
                name,
                format!(
                    "work-group size {workgroup_size} outside 1..={}",
                    self.max_workgroup_size
                ),
            ));
        }
        if global_size % workgroup_size != 0 {
            return Err(fault(
                name,
                format!("global size {global_size} is not a multiple of {workgroup_size}"),
            ));
        }
        let args = Args { kernel: name, args };
        args.check_distinct_buffers()?;
        trace!(kernel = name, global_size, workgroup_size, "host dispatch");

        self.run(&host_kernel, &args, global_size, workgroup_size)
    }

    fn finish(&mut self) -> Result<(), DeviceFault> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Linear;

    fn build(acc: &mut HostAccelerator, source: &KernelSource, dims: &LayerDimensions) -> KernelId {
        let mut options = dims.kernel_options();
        options.activation(Arc::new(Linear));
        acc.build_kernel(source, &options).unwrap()
    }

    #[test]
    fn buffers_round_trip_and_free() {
        let mut acc = HostAccelerator::new();
        let buf = acc.alloc(4).unwrap();
        acc.write(buf, &[1.0, 2.0, 3.0]).unwrap();
        let mut out = [0.0; 4];
        acc.read(buf, &mut out).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0, 0.0]);
        acc.free(buf).unwrap();
        assert_eq!(acc.free(buf), Err(DeviceFault::UnknownBuffer(buf.0)));
        assert_eq!(acc.live_buffers(), 0);
    }

    #[test]
    fn oversized_write_is_a_transfer_fault() {
        let mut acc = HostAccelerator::new();
        let buf = acc.alloc(2).unwrap();
        assert!(matches!(
            acc.write(buf, &[0.0; 3]),
            Err(DeviceFault::Transfer(_))
        ));
    }

    #[test]
    fn add_in_place_accumulates() {
        let mut acc = HostAccelerator::new();
        let kernel = acc
            .build_kernel(&kernels::ADD_IN_PLACE, &KernelOptions::new())
            .unwrap();
        let deltas = acc.alloc(3).unwrap();
        let values = acc.alloc(3).unwrap();
        acc.write(deltas, &[0.5, -1.0, 2.0]).unwrap();
        acc.write(values, &[1.0, 1.0, 1.0]).unwrap();
        acc.dispatch(
            kernel,
            &[DeviceArg::Int(3), DeviceArg::Buffer(deltas), DeviceArg::Buffer(values)],
            3,
            3,
        )
        .unwrap();
        let mut out = [0.0; 3];
        acc.read(values, &mut out).unwrap();
        assert_eq!(out, [1.5, 0.0, 3.0]);
    }

    #[test]
    fn ragged_global_size_is_rejected() {
        let mut acc = HostAccelerator::with_max_workgroup_size(4);
        let kernel = acc
            .build_kernel(&kernels::ADD_IN_PLACE, &KernelOptions::new())
            .unwrap();
        let a = acc.alloc(6).unwrap();
        let b = acc.alloc(6).unwrap();
        let args = [DeviceArg::Int(6), DeviceArg::Buffer(a), DeviceArg::Buffer(b)];
        assert!(matches!(
            acc.dispatch(kernel, &args, 6, 4),
            Err(DeviceFault::Dispatch { .. })
        ));
        assert!(matches!(
            acc.dispatch(kernel, &args, 16, 8),
            Err(DeviceFault::Dispatch { .. })
        ));
        assert!(acc.dispatch(kernel, &args, 8, 4).is_ok());
    }

    #[test]
    fn aliased_buffers_are_rejected() {
        let mut acc = HostAccelerator::new();
        let kernel = acc
            .build_kernel(&kernels::ADD_IN_PLACE, &KernelOptions::new())
            .unwrap();
        let a = acc.alloc(2).unwrap();
        let err = acc
            .dispatch(
                kernel,
                &[DeviceArg::Int(2), DeviceArg::Buffer(a), DeviceArg::Buffer(a)],
                2,
                2,
            )
            .unwrap_err();
        assert!(matches!(err, DeviceFault::Dispatch { .. }));
        // the buffer survives a rejected dispatch
        assert_eq!(acc.live_buffers(), 1);
    }

    #[test]
    fn unknown_kernel_name_fails_to_build() {
        let mut acc = HostAccelerator::new();
        let bogus = KernelSource {
            name: "bogus",
            wgsl: "",
            defines: &[],
            needs_activation: false,
        };
        assert!(matches!(
            acc.build_kernel(&bogus, &KernelOptions::new()),
            Err(DeviceFault::Build { .. })
        ));
    }

    #[test]
    fn convolve_sums_the_filter_window() {
        let dims = LayerDimensions::new(1, 3, 1, 3, false, true).unwrap();
        let mut acc = HostAccelerator::new();
        let kernel = build(&mut acc, &kernels::CONVOLVE, &dims);
        let images = acc.alloc(9).unwrap();
        let filters = acc.alloc(9).unwrap();
        let biases = acc.alloc(1).unwrap();
        let results = acc.alloc(1).unwrap();
        acc.write(images, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]).unwrap();
        acc.write(filters, &[1.0; 9]).unwrap();
        acc.write(biases, &[0.5]).unwrap();
        acc.dispatch(
            kernel,
            &[
                DeviceArg::Int(1),
                DeviceArg::Buffer(images),
                DeviceArg::Buffer(filters),
                DeviceArg::Buffer(biases),
                DeviceArg::Buffer(results),
            ],
            1,
            1,
        )
        .unwrap();
        let mut out = [0.0];
        acc.read(results, &mut out).unwrap();
        assert_eq!(out, [45.5]);
    }

    #[test]
    fn scratch_kernel_needs_enough_local_space() {
        let dims = LayerDimensions::new(1, 6, 2, 3, false, true).unwrap();
        let mut acc = HostAccelerator::new();
        let kernel = build(&mut acc, &kernels::BACKPROP_WEIGHTS_SCRATCH, &dims);
        let bufs: Vec<_> = [36, 32, 32, 18].iter().map(|&n| acc.alloc(n).unwrap()).collect();
        let err = acc
            .dispatch(
                kernel,
                &[
                    DeviceArg::Int(1),
                    DeviceArg::Float(0.1),
                    DeviceArg::Buffer(bufs[0]),
                    DeviceArg::Buffer(bufs[1]),
                    DeviceArg::Buffer(bufs[2]),
                    DeviceArg::Buffer(bufs[3]),
                    DeviceArg::Local(36),
                    DeviceArg::Local(8),
                    DeviceArg::Local(16),
                ],
                18,
                9,
            )
            .unwrap_err();
        assert!(matches!(err, DeviceFault::Dispatch { .. }));
    }
}

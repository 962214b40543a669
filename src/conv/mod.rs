//! Convolutional layer.
//!
//! A [`ConvLayer`] owns three persistent mirrors (weights, bias and output
//! activations) inside a [`Context`] and drives the kernels of its submodules:
//!
//! - [`forward`]: one work item per output cell
//! - [`weights`]: the three weight-gradient strategies
//! - [`bias`]: standalone bias gradient
//! - [`upstream`]: errors for the previous stage
//! - [`update`]: in-place accumulation of the deltas
//!
//! [`reference`] recomputes every formula with plain loops on the host.

mod bias;
mod config;
mod forward;
pub mod reference;
mod update;
mod upstream;
pub mod weights;

pub use config::ConvLayerConfig;
pub use weights::{
    GradientPass, Naive, SCRATCH_MAX_FILTER_SIZE, Scratch, ScratchWithBias, WeightGradient,
    learning_multiplier, select_strategy,
};

use crate::accel::KernelId;
use crate::activation::ActivationFunction;
use crate::dims::LayerDimensions;
use crate::error::{ConvError, Result};
use crate::kernels;
use crate::layer::{Upstream, UpstreamActivations};
use crate::loss::Loss;
use crate::sync::{Context, MirrorHandle, TransientScope};
use core::fmt;
use core::fmt::Write as _;
use forward::ForwardPass;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, debug_span, trace};

/// Converts a size to the `i32` the kernels take.
pub(crate) fn kernel_int(value: usize) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| ConvError::InvalidConfig(format!("{value} does not fit a 32-bit kernel argument")))
}

/// Kernels built for one layer shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerKernels {
    pub(crate) convolve: KernelId,
    pub(crate) backprop_weights: KernelId,
    pub(crate) backprop_weights_scratch: KernelId,
    pub(crate) backprop_weights_scratch_bias: KernelId,
    pub(crate) errors_for_upstream: KernelId,
    pub(crate) backprop_bias: KernelId,
    pub(crate) add_in_place: KernelId,
}

impl LayerKernels {
    fn build(
        ctx: &mut Context,
        dims: &LayerDimensions,
        activation: &Arc<dyn ActivationFunction>,
    ) -> Result<Self> {
        let mut options = dims.kernel_options();
        options.activation(Arc::clone(activation));
        Ok(Self {
            convolve: ctx.build_kernel(&kernels::CONVOLVE, &options)?,
            backprop_weights: ctx.build_kernel(&kernels::BACKPROP_WEIGHTS, &options)?,
            backprop_weights_scratch: ctx.build_kernel(&kernels::BACKPROP_WEIGHTS_SCRATCH, &options)?,
            backprop_weights_scratch_bias: ctx
                .build_kernel(&kernels::BACKPROP_WEIGHTS_SCRATCH_BIAS, &options)?,
            errors_for_upstream: ctx.build_kernel(&kernels::CALC_ERRORS_FOR_UPSTREAM, &options)?,
            backprop_bias: ctx.build_kernel(&kernels::BACKPROP_BIAS, &options)?,
            add_in_place: ctx.build_kernel(&kernels::ADD_IN_PLACE, &options)?,
        })
    }
}

/// Weight and bias deltas of one gradient pass, not yet applied.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientDeltas {
    /// Same layout as the weight tensor.
    pub weights: Vec<f32>,
    /// One per filter; empty for unbiased layers.
    pub bias: Vec<f32>,
}

/// A 2D convolutional layer bound to a [`Context`].
#[derive(Debug)]
pub struct ConvLayer {
    dims: LayerDimensions,
    activation: Arc<dyn ActivationFunction>,
    kernels: LayerKernels,
    weights: MirrorHandle,
    bias: MirrorHandle,
    output: Option<MirrorHandle>,
    batch_size: usize,
    allocated_batch: usize,
    output_allocations: usize,
}

/// Device mirror holding the upstream activations for one call.
fn upstream_mirror(
    ctx: &mut Context,
    scope: &mut TransientScope,
    upstream: &dyn Upstream,
    len: usize,
) -> Result<MirrorHandle> {
    match upstream.activations() {
        UpstreamActivations::Resident(handle) => {
            let got = ctx.len(handle)?;
            if got < len {
                return Err(ConvError::LengthMismatch {
                    what: "upstream activations",
                    expected: len,
                    got,
                });
            }
            ctx.ensure_on_device(handle)?;
            Ok(handle)
        }
        UpstreamActivations::Host(data) => {
            let images = data.get(..len).ok_or(ConvError::LengthMismatch {
                what: "upstream activations",
                expected: len,
                got: data.len(),
            })?;
            scope.upload(ctx, images)
        }
    }
}

fn check_len(what: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(ConvError::LengthMismatch { what, expected, got })
    }
}

impl ConvLayer {
    /// Builds the kernels for `dims`, binds weights and bias and randomizes
    /// them from the thread RNG.
    ///
    /// # Errors
    ///
    /// Device faults from kernel builds or allocations.
    pub fn new(
        ctx: &mut Context,
        dims: LayerDimensions,
        activation: Arc<dyn ActivationFunction>,
    ) -> Result<Self> {
        Self::with_rng(ctx, dims, activation, &mut rand::rng())
    }

    /// As [`new`](Self::new), drawing the initial weights from `rng`.
    ///
    /// # Errors
    ///
    /// Device faults from kernel builds or allocations.
    pub fn with_rng<R: Rng + ?Sized>(
        ctx: &mut Context,
        dims: LayerDimensions,
        activation: Arc<dyn ActivationFunction>,
        rng: &mut R,
    ) -> Result<Self> {
        let kernels = LayerKernels::build(ctx, &dims, &activation)?;
        let weights = ctx.bind_zeroed(dims.weights_size())?;
        let bias = ctx.bind_zeroed(dims.bias_size().max(1))?;
        let mut layer = Self {
            dims,
            activation,
            kernels,
            weights,
            bias,
            output: None,
            batch_size: 0,
            allocated_batch: 0,
            output_allocations: 0,
        };
        layer.randomize_weights_with(ctx, rng)?;
        debug!(layer = %layer, "created");
        Ok(layer)
    }

    /// Shape of the layer.
    #[must_use]
    pub const fn dims(&self) -> &LayerDimensions {
        &self.dims
    }

    /// Activation applied by the forward kernel.
    #[must_use]
    pub fn activation(&self) -> &dyn ActivationFunction {
        self.activation.as_ref()
    }

    /// Current batch size; zero until [`set_batch_size`](Self::set_batch_size).
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// How many times the output mirror has been (re)allocated.
    #[must_use]
    pub const fn output_allocations(&self) -> usize {
        self.output_allocations
    }

    /// Elements of the weight tensor.
    #[must_use]
    pub const fn weights_size(&self) -> usize {
        self.dims.weights_size()
    }

    /// One per filter when biased, else zero.
    #[must_use]
    pub const fn bias_size(&self) -> usize {
        self.dims.bias_size()
    }

    /// Filters, i.e. output planes.
    #[must_use]
    pub const fn output_planes(&self) -> usize {
        self.dims.num_filters()
    }

    /// Edge length of each output board.
    #[must_use]
    pub const fn output_board_size(&self) -> usize {
        self.dims.output_board_size()
    }

    /// Output elements per example.
    #[must_use]
    pub const fn output_cube_size(&self) -> usize {
        self.dims.output_cube_size()
    }

    /// Output elements for the current batch.
    #[must_use]
    pub const fn output_size(&self) -> usize {
        self.batch_size * self.dims.output_cube_size()
    }

    /// Sets the number of examples per call. The output mirror only grows:
    /// a size within the largest one seen so far reuses it.
    ///
    /// # Errors
    ///
    /// [`ConvError::InvalidConfig`] for zero, device faults on reallocation.
    pub fn set_batch_size(&mut self, ctx: &mut Context, batch_size: usize) -> Result<()> {
        if batch_size == 0 {
            return Err(ConvError::InvalidConfig("batch size must be positive".into()));
        }
        if batch_size <= self.allocated_batch {
            self.batch_size = batch_size;
            return Ok(());
        }

        // a failed allocation leaves the previous batch intact
        let fresh = ctx.bind_zeroed(batch_size * self.dims.output_cube_size())?;
        let old = self.output.replace(fresh);
        self.batch_size = batch_size;
        self.allocated_batch = batch_size;
        self.output_allocations += 1;
        debug!(batch_size, allocations = self.output_allocations, "allocated output");
        if let Some(old) = old {
            ctx.release(old)?;
        }
        Ok(())
    }

    fn output_mirror(&self) -> Result<MirrorHandle> {
        self.output
            .ok_or_else(|| ConvError::InvalidConfig("batch size has not been set".into()))
    }

    fn check_upstream(&self, upstream: &dyn Upstream) -> Result<()> {
        if upstream.output_planes() != self.dims.input_planes()
            || upstream.output_board_size() != self.dims.input_board_size()
        {
            return Err(ConvError::InvalidConfig(format!(
                "upstream emits {} planes of {}x{}, layer expects {} planes of {}x{}",
                upstream.output_planes(),
                upstream.output_board_size(),
                upstream.output_board_size(),
                self.dims.input_planes(),
                self.dims.input_board_size(),
                self.dims.input_board_size()
            )));
        }
        Ok(())
    }

    /// Convolves the upstream activations into the output mirror.
    ///
    /// # Errors
    ///
    /// Shape mismatches with `upstream`, unset batch size, device faults.
    pub fn forward(&mut self, ctx: &mut Context, upstream: &dyn Upstream) -> Result<()> {
        self.check_upstream(upstream)?;
        let output = self.output_mirror()?;
        let _span = debug_span!("forward", batch = self.batch_size, layer = %self).entered();

        ctx.ensure_on_device(self.weights)?;
        ctx.ensure_on_device(self.bias)?;
        let images_len = self.batch_size * self.dims.input_cube_size();
        ctx.with_scope(|ctx, scope| {
            let images = upstream_mirror(ctx, scope, upstream, images_len)?;
            trace!("upstream on device");
            forward::propagate(
                ctx,
                self.kernels.convolve,
                &self.dims,
                &ForwardPass {
                    batch_size: self.batch_size,
                    images,
                    weights: self.weights,
                    bias: self.bias,
                    output,
                },
            )?;
            trace!("after finish");
            Ok(())
        })
    }

    fn gradient_pass<'a>(
        &'a self,
        learning_rate: f32,
        images: MirrorHandle,
        errors: MirrorHandle,
        weight_changes: MirrorHandle,
        bias_changes: MirrorHandle,
    ) -> Result<GradientPass<'a>> {
        Ok(GradientPass {
            dims: &self.dims,
            kernels: &self.kernels,
            batch_size: kernel_int(self.batch_size)?,
            learning_multiplier: learning_multiplier(&self.dims, self.batch_size, learning_rate),
            images,
            output: self.output_mirror()?,
            errors,
            weight_changes,
            bias_changes,
        })
    }

    /// Runs `strategy` (and the standalone bias kernel when it does not fuse
    /// the bias) into fresh scoped delta mirrors.
    fn compute_deltas(
        &self,
        ctx: &mut Context,
        scope: &mut TransientScope,
        upstream: &dyn Upstream,
        learning_rate: f32,
        errors: MirrorHandle,
        strategy: &dyn WeightGradient,
    ) -> Result<(MirrorHandle, MirrorHandle)> {
        let output = self.output_mirror()?;
        ctx.ensure_on_device(output)?;
        let images = upstream_mirror(
            ctx,
            scope,
            upstream,
            self.batch_size * self.dims.input_cube_size(),
        )?;
        let weight_changes = scope.zeroed(ctx, self.dims.weights_size())?;
        let bias_changes = scope.zeroed(ctx, self.dims.bias_size().max(1))?;
        let pass = self.gradient_pass(learning_rate, images, errors, weight_changes, bias_changes)?;

        strategy.compute(ctx, &pass)?;
        trace!(strategy = strategy.name(), "weight gradient done");
        if !strategy.computes_bias() {
            bias::backprop_bias(ctx, &pass)?;
            trace!("bias gradient done");
        }
        Ok((weight_changes, bias_changes))
    }

    /// Deltas `strategy` produces for `errors`, without applying them.
    ///
    /// # Errors
    ///
    /// Length or shape mismatches, unset batch size, device faults.
    pub fn weight_gradient(
        &self,
        ctx: &mut Context,
        upstream: &dyn Upstream,
        learning_rate: f32,
        errors: &[f32],
        strategy: &dyn WeightGradient,
    ) -> Result<GradientDeltas> {
        self.check_upstream(upstream)?;
        check_len("errors", self.output_size(), errors.len())?;
        let bias_size = self.dims.bias_size();
        ctx.with_scope(|ctx, scope| {
            let errors = scope.upload(ctx, errors)?;
            let (weight_changes, bias_changes) =
                self.compute_deltas(ctx, scope, upstream, learning_rate, errors, strategy)?;
            Ok(GradientDeltas {
                weights: ctx.host_view(weight_changes)?.to_vec(),
                bias: ctx.host_view(bias_changes)?[..bias_size].to_vec(),
            })
        })
    }

    /// Backward pass: gradients, errors for the upstream stage (from the
    /// weights as they were before this call), then the update.
    ///
    /// `errors_for_upstream` is skipped when `None`, as for the first layer
    /// of a chain.
    ///
    /// # Errors
    ///
    /// Length or shape mismatches, unset batch size, device faults.
    pub fn backward(
        &mut self,
        ctx: &mut Context,
        upstream: &dyn Upstream,
        learning_rate: f32,
        errors: &[f32],
        errors_for_upstream: Option<&mut [f32]>,
    ) -> Result<()> {
        self.check_upstream(upstream)?;
        check_len("errors", self.output_size(), errors.len())?;
        let upstream_len = self.batch_size * self.dims.input_cube_size();
        if let Some(dest) = errors_for_upstream.as_deref() {
            check_len("errors for upstream", upstream_len, dest.len())?;
        }
        let _span = debug_span!("backward", batch = self.batch_size, learning_rate).entered();

        ctx.ensure_on_device(self.weights)?;
        ctx.ensure_on_device(self.bias)?;
        let strategy = select_strategy(self.dims.filter_size());
        let bias_size = self.dims.bias_size();
        ctx.with_scope(|ctx, scope| {
            let errors = scope.upload(ctx, errors)?;
            let (weight_changes, bias_changes) =
                self.compute_deltas(ctx, scope, upstream, learning_rate, errors, strategy)?;

            if let Some(dest) = errors_for_upstream {
                let out = scope.zeroed(ctx, upstream_len)?;
                upstream::calc_errors_for_upstream(
                    ctx,
                    self.kernels.errors_for_upstream,
                    &self.dims,
                    self.batch_size,
                    self.weights,
                    errors,
                    out,
                )?;
                dest.copy_from_slice(ctx.host_view(out)?);
                trace!("errors for upstream done");
            }

            update::add_in_place(
                ctx,
                self.kernels.add_in_place,
                weight_changes,
                self.weights,
                self.dims.weights_size(),
            )?;
            if bias_size > 0 {
                let deltas = ctx.host_view(bias_changes)?[..bias_size].to_vec();
                update::add_on_host(ctx, self.bias, &deltas)?;
            }
            trace!("weights updated");
            Ok(())
        })
    }

    /// Derives the output errors from `expected` through `loss` and returns
    /// the scalar loss.
    ///
    /// # Errors
    ///
    /// Length mismatches, unset batch size, transfer faults.
    pub fn calc_errors(
        &self,
        ctx: &mut Context,
        expected: &[f32],
        loss: &dyn Loss,
        errors: &mut [f32],
    ) -> Result<f32> {
        let size = self.output_size();
        check_len("expected", size, expected.len())?;
        check_len("errors", size, errors.len())?;
        let output = self.output(ctx)?;
        loss.errors(output, expected, errors);
        Ok(loss.loss(output, expected))
    }

    /// Output activations of the current batch, pulled to the host on demand.
    ///
    /// # Errors
    ///
    /// Unset batch size, transfer faults.
    pub fn output<'c>(&self, ctx: &'c mut Context) -> Result<&'c [f32]> {
        let size = self.output_size();
        Ok(&ctx.host_view(self.output_mirror()?)?[..size])
    }

    /// Flat index of `(example, plane, row, col)` in the output.
    #[must_use]
    pub const fn output_index(&self, example: usize, plane: usize, row: usize, col: usize) -> usize {
        self.dims.output_index(example, plane, row, col)
    }

    /// # Errors
    ///
    /// Transfer faults.
    pub fn weights<'c>(&self, ctx: &'c mut Context) -> Result<&'c [f32]> {
        ctx.host_view(self.weights)
    }

    /// One bias per filter; empty when unbiased.
    ///
    /// # Errors
    ///
    /// Transfer faults.
    pub fn bias<'c>(&self, ctx: &'c mut Context) -> Result<&'c [f32]> {
        let size = self.dims.bias_size();
        Ok(&ctx.host_view(self.bias)?[..size])
    }

    /// A single weight by coordinates.
    ///
    /// # Errors
    ///
    /// [`ConvError::InvalidConfig`] for coordinates outside the filter bank,
    /// transfer faults.
    pub fn weight(
        &self,
        ctx: &mut Context,
        filter: usize,
        plane: usize,
        row: usize,
        col: usize,
    ) -> Result<f32> {
        let fs = self.dims.filter_size();
        if filter >= self.dims.num_filters()
            || plane >= self.dims.input_planes()
            || row >= fs
            || col >= fs
        {
            return Err(ConvError::InvalidConfig(format!(
                "weight ({filter}, {plane}, {row}, {col}) outside {} filters of {} planes of {fs}x{fs}",
                self.dims.num_filters(),
                self.dims.input_planes()
            )));
        }
        let index = self.dims.weight_index(filter, plane, row, col);
        self.weights(ctx)?
            .get(index)
            .copied()
            .ok_or_else(|| ConvError::InvalidConfig(format!("weight index {index} out of range")))
    }

    /// Renders the filter bank as one grid per `(filter, plane)` pair,
    /// followed by the bias.
    ///
    /// # Errors
    ///
    /// Transfer faults.
    pub fn format_weights(&self, ctx: &mut Context) -> Result<String> {
        let fs = self.dims.filter_size();
        let weights = self.weights(ctx)?;
        let mut out = String::new();
        for filter in 0..self.dims.num_filters() {
            for plane in 0..self.dims.input_planes() {
                let start = self.dims.weight_index(filter, plane, 0, 0);
                let _ = writeln!(out, "filter {filter} plane {plane}:");
                write_board(&mut out, &weights[start..start + fs * fs], fs);
            }
        }
        if self.dims.biased() {
            let bias = self.bias(ctx)?;
            let _ = writeln!(out, "bias: {bias:?}");
        }
        Ok(out)
    }

    /// Renders the output boards of the first `examples` examples of the
    /// current batch.
    ///
    /// # Errors
    ///
    /// Unset batch size, transfer faults.
    pub fn format_output(&self, ctx: &mut Context, examples: usize) -> Result<String> {
        let board = self.dims.output_board_size();
        let examples = examples.min(self.batch_size);
        let output = self.output(ctx)?;
        let mut out = String::new();
        for n in 0..examples {
            for plane in 0..self.dims.num_filters() {
                let start = self.dims.output_index(n, plane, 0, 0);
                let _ = writeln!(out, "example {n} plane {plane}:");
                write_board(&mut out, &output[start..start + board * board], board);
            }
        }
        Ok(out)
    }

    /// Redraws weights and bias from the thread RNG.
    ///
    /// # Errors
    ///
    /// Transfer faults.
    pub fn randomize_weights(&mut self, ctx: &mut Context) -> Result<()> {
        self.randomize_weights_with(ctx, &mut rand::rng())
    }

    /// Draws every weight and bias from `uniform(-0.5, 0.5) · sqrt(12 / fanin)`
    /// with `fanin = inputPlanes · filterSize²`.
    ///
    /// # Errors
    ///
    /// Transfer faults.
    pub fn randomize_weights_with<R: Rng + ?Sized>(
        &mut self,
        ctx: &mut Context,
        rng: &mut R,
    ) -> Result<()> {
        let fanin = (self.dims.input_planes() * self.dims.filter_size_squared()) as f32;
        let range = (12.0 / fanin).sqrt();
        for w in ctx.host_mut(self.weights)?.iter_mut() {
            *w = (rng.random::<f32>() - 0.5) * range;
        }
        let bias_size = self.dims.bias_size();
        for b in ctx.host_mut(self.bias)?[..bias_size].iter_mut() {
            *b = (rng.random::<f32>() - 0.5) * range;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// [`ConvError::LengthMismatch`] unless `weights` covers the whole tensor.
    pub fn init_weights(&mut self, ctx: &mut Context, weights: &[f32]) -> Result<()> {
        check_len("weights", self.dims.weights_size(), weights.len())?;
        ctx.host_mut(self.weights)?.copy_from_slice(weights);
        Ok(())
    }

    /// # Errors
    ///
    /// [`ConvError::LengthMismatch`] unless `bias` has one value per filter
    /// (none when unbiased).
    pub fn init_bias(&mut self, ctx: &mut Context, bias: &[f32]) -> Result<()> {
        let size = self.dims.bias_size();
        check_len("bias", size, bias.len())?;
        ctx.host_mut(self.bias)?[..size].copy_from_slice(bias);
        Ok(())
    }

    /// [`init_weights`](Self::init_weights) followed by
    /// [`init_bias`](Self::init_bias).
    ///
    /// # Errors
    ///
    /// Length mismatches; nothing is written unless both lengths match.
    pub fn set_weights(&mut self, ctx: &mut Context, weights: &[f32], bias: &[f32]) -> Result<()> {
        check_len("weights", self.dims.weights_size(), weights.len())?;
        check_len("bias", self.dims.bias_size(), bias.len())?;
        self.init_weights(ctx, weights)?;
        self.init_bias(ctx, bias)
    }

    /// Values written by [`persist_to`](Self::persist_to).
    #[must_use]
    pub const fn persist_size(&self) -> usize {
        self.dims.weights_size() + self.dims.bias_size()
    }

    /// Writes weights followed by bias.
    ///
    /// # Errors
    ///
    /// Length mismatch, transfer faults.
    pub fn persist_to(&self, ctx: &mut Context, array: &mut [f32]) -> Result<()> {
        check_len("persisted layer", self.persist_size(), array.len())?;
        let (weights, bias) = array.split_at_mut(self.dims.weights_size());
        weights.copy_from_slice(self.weights(ctx)?);
        bias.copy_from_slice(self.bias(ctx)?);
        Ok(())
    }

    /// Reads weights followed by bias, as written by
    /// [`persist_to`](Self::persist_to).
    ///
    /// # Errors
    ///
    /// Length mismatch, transfer faults.
    pub fn unpersist_from(&mut self, ctx: &mut Context, array: &[f32]) -> Result<()> {
        check_len("persisted layer", self.persist_size(), array.len())?;
        let (weights, bias) = array.split_at(self.dims.weights_size());
        self.set_weights(ctx, weights, bias)
    }

    /// Frees every mirror the layer owns.
    ///
    /// # Errors
    ///
    /// The first release fault; the remaining mirrors are still released.
    pub fn release(self, ctx: &mut Context) -> Result<()> {
        let mut result = Ok(());
        for handle in [Some(self.weights), Some(self.bias), self.output]
            .into_iter()
            .flatten()
        {
            if let Err(e) = ctx.release(handle) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

fn write_board(out: &mut String, cells: &[f32], board: usize) {
    for row in cells.chunks(board) {
        for (i, v) in row.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            let _ = write!(out, "{v:>9.5}");
        }
        out.push('\n');
    }
}

impl fmt::Display for ConvLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConvLayer{{ filters={} filterSize={} padZeros={} biased={} outputBoardSize={} }}",
            self.dims.num_filters(),
            self.dims.filter_size(),
            self.dims.pad_zeros(),
            self.dims.biased(),
            self.dims.output_board_size()
        )
    }
}

impl Upstream for ConvLayer {
    fn output_planes(&self) -> usize {
        self.dims.num_filters()
    }

    fn output_board_size(&self) -> usize {
        self.dims.output_board_size()
    }

    fn activations(&self) -> UpstreamActivations<'_> {
        match self.output {
            Some(handle) => UpstreamActivations::Resident(handle),
            None => UpstreamActivations::Host(&[]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::host::HostAccelerator;
    use crate::accel::{Accelerator, DeviceArg, DeviceBufferId, KernelOptions};
    use crate::activation::{Linear, Tanh};
    use crate::approx::{assert_slices_close, F32_AVG_ERROR};
    use crate::error::DeviceFault;
    use crate::kernels::KernelSource;
    use crate::layer::InputLayer;
    use crate::sync::Freshness;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn layer(ctx: &mut Context, dims: LayerDimensions) -> ConvLayer {
        let mut rng = StdRng::seed_from_u64(7);
        ConvLayer::with_rng(ctx, dims, Arc::new(Linear), &mut rng).unwrap()
    }

    /// Host accelerator that refuses allocations above `max_len`.
    struct CappedHost {
        inner: HostAccelerator,
        max_len: usize,
    }

    impl Accelerator for CappedHost {
        fn name(&self) -> &str {
            "capped"
        }

        fn max_workgroup_size(&self) -> usize {
            self.inner.max_workgroup_size()
        }

        fn build_kernel(
            &mut self,
            source: &KernelSource,
            options: &KernelOptions,
        ) -> std::result::Result<KernelId, DeviceFault> {
            self.inner.build_kernel(source, options)
        }

        fn alloc(&mut self, len: usize) -> std::result::Result<DeviceBufferId, DeviceFault> {
            if len > self.max_len {
                return Err(DeviceFault::Transfer(format!("{len} elements over the cap")));
            }
            self.inner.alloc(len)
        }

        fn write(
            &mut self,
            buffer: DeviceBufferId,
            data: &[f32],
        ) -> std::result::Result<(), DeviceFault> {
            self.inner.write(buffer, data)
        }

        fn read(
            &mut self,
            buffer: DeviceBufferId,
            out: &mut [f32],
        ) -> std::result::Result<(), DeviceFault> {
            self.inner.read(buffer, out)
        }

        fn free(&mut self, buffer: DeviceBufferId) -> std::result::Result<(), DeviceFault> {
            self.inner.free(buffer)
        }

        fn dispatch(
            &mut self,
            kernel: KernelId,
            args: &[DeviceArg],
            global_size: usize,
            workgroup_size: usize,
        ) -> std::result::Result<(), DeviceFault> {
            self.inner.dispatch(kernel, args, global_size, workgroup_size)
        }

        fn finish(&mut self) -> std::result::Result<(), DeviceFault> {
            self.inner.finish()
        }
    }

    #[test]
    fn failed_output_allocation_keeps_the_previous_batch() {
        let mut ctx = Context::new(Box::new(CappedHost {
            inner: HostAccelerator::new(),
            max_len: 80,
        }));
        let dims = LayerDimensions::new(1, 6, 2, 3, false, true).unwrap();
        let mut conv = layer(&mut ctx, dims);
        conv.set_batch_size(&mut ctx, 2).unwrap();
        let mut input = InputLayer::new(1, 6).unwrap();
        input.set_input(&[1.0; 72]).unwrap();
        conv.forward(&mut ctx, &input).unwrap();

        // 3 examples need 96 output cells
        assert!(matches!(
            conv.set_batch_size(&mut ctx, 3),
            Err(ConvError::Device(DeviceFault::Transfer(_)))
        ));
        assert_eq!(conv.batch_size(), 2);
        assert_eq!(conv.output_allocations(), 1);
        assert_eq!(conv.output(&mut ctx).unwrap().len(), 64);
        conv.forward(&mut ctx, &input).unwrap();
        assert_eq!(ctx.live_mirrors(), 3);
    }

    #[test]
    fn out_of_range_weight_coordinates_are_errors() {
        let mut ctx = Context::host();
        let dims = LayerDimensions::new(2, 5, 3, 3, false, true).unwrap();
        let conv = layer(&mut ctx, dims);
        let last = conv.weights(&mut ctx).unwrap()[dims.weights_size() - 1];
        assert_eq!(conv.weight(&mut ctx, 2, 1, 2, 2).unwrap(), last);
        for (f, p, r, c) in [(3, 0, 0, 0), (0, 2, 0, 0), (0, 0, 3, 0), (2, 1, 2, 3)] {
            assert!(matches!(
                conv.weight(&mut ctx, f, p, r, c),
                Err(ConvError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn formatted_dumps_list_every_board() {
        let mut ctx = Context::host();
        let dims = LayerDimensions::new(1, 4, 2, 3, false, true).unwrap();
        let mut conv = layer(&mut ctx, dims);
        conv.set_weights(&mut ctx, &[0.25; 18], &[0.5, -0.5]).unwrap();
        let weights = conv.format_weights(&mut ctx).unwrap();
        assert!(weights.contains("filter 1 plane 0:"));
        assert_eq!(weights.matches("0.25000").count(), 18);
        assert!(weights.ends_with("bias: [0.5, -0.5]\n"));

        conv.set_batch_size(&mut ctx, 2).unwrap();
        let mut input = InputLayer::new(1, 4).unwrap();
        input.set_input(&[0.0; 32]).unwrap();
        conv.forward(&mut ctx, &input).unwrap();
        let output = conv.format_output(&mut ctx, 5).unwrap();
        assert!(output.contains("example 1 plane 1:"));
        // two examples of two 2x2 boards
        assert_eq!(output.lines().count(), 4 * 3);
        assert_eq!(output.matches("-0.50000").count(), 8);
    }

    #[test]
    fn forward_before_batch_size_is_an_error() {
        let mut ctx = Context::host();
        let dims = LayerDimensions::new(1, 4, 1, 3, false, true).unwrap();
        let mut conv = layer(&mut ctx, dims);
        let input = InputLayer::new(1, 4).unwrap();
        assert!(matches!(
            conv.forward(&mut ctx, &input),
            Err(ConvError::InvalidConfig(_))
        ));
    }

    #[test]
    fn mismatched_upstream_is_rejected() {
        let mut ctx = Context::host();
        let dims = LayerDimensions::new(2, 5, 1, 3, false, true).unwrap();
        let mut conv = layer(&mut ctx, dims);
        conv.set_batch_size(&mut ctx, 1).unwrap();
        let input = InputLayer::new(1, 5).unwrap();
        assert!(matches!(
            conv.forward(&mut ctx, &input),
            Err(ConvError::InvalidConfig(_))
        ));
    }

    #[test]
    fn randomized_weights_stay_in_range() {
        let mut ctx = Context::host();
        let dims = LayerDimensions::new(3, 7, 4, 5, true, true).unwrap();
        let conv = layer(&mut ctx, dims);
        let range = (12.0_f32 / 75.0).sqrt();
        let weights = conv.weights(&mut ctx).unwrap();
        assert!(weights.iter().all(|w| w.abs() <= range / 2.0));
        assert!(weights.iter().any(|w| *w != 0.0));
        assert_eq!(conv.bias(&mut ctx).unwrap().len(), 4);
    }

    #[test]
    fn persisted_layout_is_weights_then_bias() {
        let mut ctx = Context::host();
        let dims = LayerDimensions::new(1, 3, 2, 1, false, true).unwrap();
        let mut conv = layer(&mut ctx, dims);
        conv.set_weights(&mut ctx, &[1.0, 2.0], &[3.0, 4.0]).unwrap();
        let mut array = vec![0.0; conv.persist_size()];
        conv.persist_to(&mut ctx, &mut array).unwrap();
        assert_eq!(array, [1.0, 2.0, 3.0, 4.0]);

        let mut other = layer(&mut ctx, dims);
        other.unpersist_from(&mut ctx, &array).unwrap();
        assert_eq!(other.weights(&mut ctx).unwrap(), &[1.0, 2.0]);
        assert_eq!(other.bias(&mut ctx).unwrap(), &[3.0, 4.0]);
    }

    #[test]
    fn set_weights_checks_both_lengths_first() {
        let mut ctx = Context::host();
        let dims = LayerDimensions::new(1, 3, 2, 1, false, true).unwrap();
        let mut conv = layer(&mut ctx, dims);
        let before = conv.weights(&mut ctx).unwrap().to_vec();
        let err = conv.set_weights(&mut ctx, &[1.0, 2.0], &[3.0]).unwrap_err();
        assert_eq!(
            err,
            ConvError::LengthMismatch {
                what: "bias",
                expected: 2,
                got: 1
            }
        );
        assert_eq!(conv.weights(&mut ctx).unwrap(), before.as_slice());
    }

    #[test]
    fn backward_matches_reference_update() {
        let mut ctx = Context::host();
        let dims = LayerDimensions::new(2, 5, 3, 3, true, true).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let mut conv = ConvLayer::with_rng(&mut ctx, dims, Arc::new(Tanh), &mut rng).unwrap();
        conv.set_batch_size(&mut ctx, 2).unwrap();

        let mut input = InputLayer::new(2, 5).unwrap();
        let images: Vec<f32> = (0..100).map(|_| rng.random::<f32>() - 0.5).collect();
        input.set_input(&images).unwrap();
        let errors: Vec<f32> = (0..conv.output_size()).map(|_| rng.random::<f32>() - 0.5).collect();

        let weights = conv.weights(&mut ctx).unwrap().to_vec();
        let bias = conv.bias(&mut ctx).unwrap().to_vec();
        conv.forward(&mut ctx, &input).unwrap();
        let output = conv.output(&mut ctx).unwrap().to_vec();

        let mut upstream_errors = vec![0.0; 100];
        conv.backward(&mut ctx, &input, 0.1, &errors, Some(&mut upstream_errors))
            .unwrap();

        let mut expected_weights = weights.clone();
        reference::update(
            &mut expected_weights,
            &reference::weight_deltas(&dims, &Tanh, 2, 0.1, &images, &output, &errors),
        );
        let mut expected_bias = bias;
        reference::update(
            &mut expected_bias,
            &reference::bias_deltas(&dims, &Tanh, 2, 0.1, &output, &errors),
        );
        assert_slices_close(conv.weights(&mut ctx).unwrap(), &expected_weights, F32_AVG_ERROR);
        assert_slices_close(conv.bias(&mut ctx).unwrap(), &expected_bias, F32_AVG_ERROR);
        assert_slices_close(
            &upstream_errors,
            &reference::errors_for_upstream(&dims, 2, &weights, &errors),
            F32_AVG_ERROR,
        );
    }

    #[test]
    fn bias_update_is_applied_on_the_host() {
        let mut ctx = Context::host();
        let dims = LayerDimensions::new(1, 4, 1, 3, false, true).unwrap();
        let mut conv = layer(&mut ctx, dims);
        conv.set_batch_size(&mut ctx, 1).unwrap();
        let mut input = InputLayer::new(1, 4).unwrap();
        input.set_input(&[1.0; 16]).unwrap();
        conv.forward(&mut ctx, &input).unwrap();
        conv.backward(&mut ctx, &input, 0.5, &[1.0; 4], None).unwrap();
        assert_eq!(ctx.freshness(conv.bias).unwrap(), Freshness::HostDirty);
        assert_eq!(ctx.freshness(conv.weights).unwrap(), Freshness::DeviceDirty);
    }

    #[test]
    fn display_names_the_shape() {
        let mut ctx = Context::host();
        let dims = LayerDimensions::new(1, 8, 2, 3, false, true).unwrap();
        let conv = layer(&mut ctx, dims);
        assert_eq!(
            conv.to_string(),
            "ConvLayer{ filters=2 filterSize=3 padZeros=false biased=true outputBoardSize=6 }"
        );
    }

    #[test]
    fn release_frees_every_mirror() {
        let mut ctx = Context::host();
        let dims = LayerDimensions::new(1, 4, 1, 3, false, false).unwrap();
        let mut conv = layer(&mut ctx, dims);
        conv.set_batch_size(&mut ctx, 3).unwrap();
        assert_eq!(ctx.live_mirrors(), 3);
        conv.release(&mut ctx).unwrap();
        assert_eq!(ctx.live_mirrors(), 0);
    }
}

//! Fluent maker for [`ConvLayer`].

use super::ConvLayer;
use crate::activation::{ActivationFunction, Tanh};
use crate::dims::LayerDimensions;
use crate::error::Result;
use crate::layer::Upstream;
use crate::sync::Context;
use rand::Rng;
use std::sync::Arc;

/// Everything a [`ConvLayer`] needs besides its upstream.
///
/// Defaults: one 3x3 filter, no padding, biased, `tanh`.
///
/// ```
/// use briny_conv::activation::Linear;
/// use briny_conv::conv::ConvLayerConfig;
/// use briny_conv::layer::InputLayer;
/// use briny_conv::sync::Context;
/// use std::sync::Arc;
///
/// let mut ctx = Context::host();
/// let input = InputLayer::new(1, 8).unwrap();
/// let conv = ConvLayerConfig::default()
///     .num_filters(2)
///     .filter_size(3)
///     .activation(Arc::new(Linear))
///     .build(&mut ctx, &input)
///     .unwrap();
/// assert_eq!(conv.output_board_size(), 6);
/// ```
#[derive(Debug, Clone)]
pub struct ConvLayerConfig {
    num_filters: usize,
    filter_size: usize,
    pad_zeros: bool,
    biased: bool,
    activation: Arc<dyn ActivationFunction>,
}

impl Default for ConvLayerConfig {
    fn default() -> Self {
        Self {
            num_filters: 1,
            filter_size: 3,
            pad_zeros: false,
            biased: true,
            activation: Arc::new(Tanh),
        }
    }
}

impl ConvLayerConfig {
    /// Number of filters, i.e. output planes.
    #[must_use]
    pub fn num_filters(mut self, num_filters: usize) -> Self {
        self.num_filters = num_filters;
        self
    }

    /// Edge length of each filter.
    #[must_use]
    pub fn filter_size(mut self, filter_size: usize) -> Self {
        self.filter_size = filter_size;
        self
    }

    /// Pad the upstream board so the output keeps its size. Needs an odd
    /// filter.
    #[must_use]
    pub fn pad_zeros(mut self, pad_zeros: bool) -> Self {
        self.pad_zeros = pad_zeros;
        self
    }

    /// Whether each filter adds a trained bias.
    #[must_use]
    pub fn biased(mut self, biased: bool) -> Self {
        self.biased = biased;
        self
    }

    /// Activation applied to every output cell.
    #[must_use]
    pub fn activation(mut self, activation: Arc<dyn ActivationFunction>) -> Self {
        self.activation = activation;
        self
    }

    /// Shape of a layer fed by `upstream`.
    ///
    /// # Errors
    ///
    /// The configuration errors of [`LayerDimensions::new`].
    pub fn dimensions(&self, upstream: &dyn Upstream) -> Result<LayerDimensions> {
        LayerDimensions::new(
            upstream.output_planes(),
            upstream.output_board_size(),
            self.num_filters,
            self.filter_size,
            self.pad_zeros,
            self.biased,
        )
    }

    /// Builds a layer fed by `upstream`, with random initial weights.
    ///
    /// # Errors
    ///
    /// Configuration errors before anything is allocated, device faults
    /// after.
    pub fn build(&self, ctx: &mut Context, upstream: &dyn Upstream) -> Result<ConvLayer> {
        self.build_with_rng(ctx, upstream, &mut rand::rng())
    }

    /// As [`build`](Self::build), drawing the initial weights from `rng`.
    ///
    /// # Errors
    ///
    /// See [`build`](Self::build).
    pub fn build_with_rng<R: Rng + ?Sized>(
        &self,
        ctx: &mut Context,
        upstream: &dyn Upstream,
        rng: &mut R,
    ) -> Result<ConvLayer> {
        let dims = self.dimensions(upstream)?;
        ConvLayer::with_rng(ctx, dims, Arc::clone(&self.activation), rng)
    }
}

use briny_conv::activation::{ActivationFunction, Linear, Relu, ScaledTanh, Sigmoid, Tanh};
use briny_conv::approx::{assert_slices_close, F32_AVG_ERROR};
use briny_conv::conv::{reference, select_strategy, ConvLayer};
use briny_conv::dims::LayerDimensions;
use briny_conv::layer::InputLayer;
use briny_conv::sync::Context;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

fn parity(dims: LayerDimensions, activation: Arc<dyn ActivationFunction>, batch: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ctx = Context::host();
    let mut conv = ConvLayer::with_rng(&mut ctx, dims, Arc::clone(&activation), &mut rng).unwrap();
    conv.set_batch_size(&mut ctx, batch).unwrap();

    let images: Vec<f32> = (0..batch * dims.input_cube_size())
        .map(|_| rng.random_range(-1.0..1.0))
        .collect();
    let mut input = InputLayer::new(dims.input_planes(), dims.input_board_size()).unwrap();
    input.set_input(&images).unwrap();
    let weights = conv.weights(&mut ctx).unwrap().to_vec();
    let bias = conv.bias(&mut ctx).unwrap().to_vec();

    conv.forward(&mut ctx, &input).unwrap();
    let output = conv.output(&mut ctx).unwrap().to_vec();
    let expected = reference::forward(&dims, activation.as_ref(), batch, &images, &weights, &bias);
    assert_slices_close(&output, &expected, F32_AVG_ERROR);

    let errors: Vec<f32> = (0..output.len())
        .map(|_| rng.random_range(-1.0..1.0))
        .collect();
    let mut upstream_errors = vec![0.0; images.len()];
    conv.backward(&mut ctx, &input, 0.3, &errors, Some(&mut upstream_errors))
        .unwrap();

    assert_slices_close(
        &upstream_errors,
        &reference::errors_for_upstream(&dims, batch, &weights, &errors),
        F32_AVG_ERROR,
    );

    let mut updated = weights;
    reference::update(
        &mut updated,
        &reference::weight_deltas(&dims, activation.as_ref(), batch, 0.3, &images, &output, &errors),
    );
    let mut updated_bias = bias;
    reference::update(
        &mut updated_bias,
        &reference::bias_deltas(&dims, activation.as_ref(), batch, 0.3, &output, &errors),
    );
    assert_slices_close(conv.weights(&mut ctx).unwrap(), &updated, F32_AVG_ERROR);
    assert_slices_close(conv.bias(&mut ctx).unwrap(), &updated_bias, F32_AVG_ERROR);
}

#[test]
fn plain_three_by_three() {
    let dims = LayerDimensions::new(1, 8, 2, 3, false, true).unwrap();
    parity(dims, Arc::new(Linear), 2, 1);
}

#[test]
fn padded_five_by_five_over_several_planes() {
    let dims = LayerDimensions::new(3, 7, 4, 5, true, true).unwrap();
    parity(dims, Arc::new(Tanh), 3, 2);
}

#[test]
fn one_by_one_filters_without_bias() {
    let dims = LayerDimensions::new(2, 9, 3, 1, false, false).unwrap();
    parity(dims, Arc::new(Sigmoid), 2, 3);
}

#[test]
fn largest_scratch_filter() {
    let dims = LayerDimensions::new(1, 20, 2, 19, false, true).unwrap();
    assert!(select_strategy(19).computes_bias());
    parity(dims, Arc::new(ScaledTanh), 2, 4);
}

#[test]
fn filters_past_the_scratch_limit_use_the_naive_path() {
    let dims = LayerDimensions::new(2, 21, 1, 21, true, true).unwrap();
    assert!(!select_strategy(21).computes_bias());
    parity(dims, Arc::new(Relu), 1, 5);
}

#[test]
fn even_filter_without_padding() {
    let dims = LayerDimensions::new(2, 6, 2, 4, false, true).unwrap();
    parity(dims, Arc::new(Tanh), 4, 6);
}

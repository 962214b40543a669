use briny_conv::accel::host::HostAccelerator;
use briny_conv::activation::{Linear, Tanh};
use briny_conv::approx::{assert_slices_close_scaled, F32_AVG_ERROR};
use briny_conv::conv::{reference, ConvLayer, Naive, Scratch, ScratchWithBias, WeightGradient};
use briny_conv::dims::LayerDimensions;
use briny_conv::layer::InputLayer;
use briny_conv::sync::Context;
use briny_conv::{ConvError, DeviceFault};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

struct Fixture {
    input: InputLayer,
    conv: ConvLayer,
    errors: Vec<f32>,
}

fn fixture(ctx: &mut Context, dims: LayerDimensions, batch: usize, seed: u64) -> Fixture {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut conv = ConvLayer::with_rng(ctx, dims, Arc::new(Tanh), &mut rng).unwrap();
    conv.set_batch_size(ctx, batch).unwrap();
    let mut input = InputLayer::new(dims.input_planes(), dims.input_board_size()).unwrap();
    let images: Vec<f32> = (0..batch * dims.input_cube_size())
        .map(|_| rng.random_range(-1.0..1.0))
        .collect();
    input.set_input(&images).unwrap();
    conv.forward(ctx, &input).unwrap();
    let errors = (0..conv.output_size())
        .map(|_| rng.random_range(-1.0..1.0))
        .collect();
    Fixture { input, conv, errors }
}

#[test]
fn all_strategies_agree_on_the_small_shape() {
    let mut ctx = Context::host();
    let dims = LayerDimensions::new(1, 6, 2, 3, false, true).unwrap();
    let f = fixture(&mut ctx, dims, 4, 3);

    let strategies: [&dyn WeightGradient; 3] = [&Naive, &Scratch, &ScratchWithBias];
    let deltas: Vec<_> = strategies
        .iter()
        .map(|s| {
            f.conv
                .weight_gradient(&mut ctx, &f.input, 0.1, &f.errors, *s)
                .unwrap()
        })
        .collect();

    assert_slices_close_scaled(&deltas[1].weights, &deltas[0].weights, F32_AVG_ERROR);
    assert_slices_close_scaled(&deltas[2].weights, &deltas[0].weights, F32_AVG_ERROR);
    // naive and scratch take the standalone bias path
    assert_slices_close_scaled(&deltas[2].bias, &deltas[0].bias, F32_AVG_ERROR);
    assert_slices_close_scaled(&deltas[1].bias, &deltas[0].bias, F32_AVG_ERROR);
    assert_eq!(deltas[0].bias.len(), 2);
}

#[test]
fn strategies_agree_with_padding_and_several_planes() {
    let mut ctx = Context::host();
    let dims = LayerDimensions::new(3, 7, 4, 5, true, true).unwrap();
    let f = fixture(&mut ctx, dims, 3, 9);

    let naive = f
        .conv
        .weight_gradient(&mut ctx, &f.input, 0.2, &f.errors, &Naive)
        .unwrap();
    let fused = f
        .conv
        .weight_gradient(&mut ctx, &f.input, 0.2, &f.errors, &ScratchWithBias)
        .unwrap();
    assert_slices_close_scaled(&fused.weights, &naive.weights, F32_AVG_ERROR);
    assert_slices_close_scaled(&fused.bias, &naive.bias, F32_AVG_ERROR);

    let images = f.input.data().to_vec();
    let output = f.conv.output(&mut ctx).unwrap().to_vec();
    assert_slices_close_scaled(
        &naive.weights,
        &reference::weight_deltas(&dims, &Tanh, 3, 0.2, &images, &output, &f.errors),
        F32_AVG_ERROR,
    );
    assert_slices_close_scaled(
        &naive.bias,
        &reference::bias_deltas(&dims, &Tanh, 3, 0.2, &output, &f.errors),
        F32_AVG_ERROR,
    );
}

#[test]
fn unbiased_layers_report_no_bias_delta() {
    let mut ctx = Context::host();
    let dims = LayerDimensions::new(2, 5, 2, 3, false, false).unwrap();
    let f = fixture(&mut ctx, dims, 2, 5);
    for strategy in [&Naive as &dyn WeightGradient, &ScratchWithBias] {
        let deltas = f
            .conv
            .weight_gradient(&mut ctx, &f.input, 0.1, &f.errors, strategy)
            .unwrap();
        assert!(deltas.bias.is_empty());
    }
}

#[test]
fn scratch_groups_larger_than_the_device_allows_fail() {
    let mut ctx = Context::new(Box::new(HostAccelerator::with_max_workgroup_size(16)));
    let dims = LayerDimensions::new(1, 6, 1, 5, false, true).unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    let mut conv = ConvLayer::with_rng(&mut ctx, dims, Arc::new(Linear), &mut rng).unwrap();
    conv.set_batch_size(&mut ctx, 1).unwrap();
    let mut input = InputLayer::new(1, 6).unwrap();
    input.set_input(&[0.5; 36]).unwrap();
    conv.forward(&mut ctx, &input).unwrap();

    let err = conv
        .weight_gradient(&mut ctx, &input, 0.1, &[1.0; 4], &Scratch)
        .unwrap_err();
    assert!(matches!(err, ConvError::Device(DeviceFault::Dispatch { .. })));
    // the naive path only needs small groups
    assert!(conv
        .weight_gradient(&mut ctx, &input, 0.1, &[1.0; 4], &Naive)
        .is_ok());
    assert_eq!(ctx.live_mirrors(), 3);
}

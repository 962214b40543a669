use briny_conv::conv::ConvLayerConfig;
use briny_conv::layer::InputLayer;
use briny_conv::sync::Context;

#[test]
fn output_only_grows_past_the_largest_batch() {
    let mut ctx = Context::host();
    let input = InputLayer::new(2, 6).unwrap();
    let mut conv = ConvLayerConfig::default()
        .num_filters(3)
        .build(&mut ctx, &input)
        .unwrap();
    assert_eq!(conv.output_allocations(), 0);

    for (batch, allocations) in [(2, 1), (4, 2), (3, 2), (1, 2), (4, 2), (5, 3), (2, 3)] {
        conv.set_batch_size(&mut ctx, batch).unwrap();
        assert_eq!(conv.batch_size(), batch);
        assert_eq!(conv.output_allocations(), allocations, "after batch {batch}");
        assert_eq!(conv.output_size(), batch * 3 * 16);
    }
    // weights, bias and a single output mirror
    assert_eq!(ctx.live_mirrors(), 3);
}

#[test]
fn shrunk_batches_only_expose_their_own_examples() {
    let mut ctx = Context::host();
    let mut input = InputLayer::new(1, 4).unwrap();
    let mut conv = ConvLayerConfig::default().build(&mut ctx, &input).unwrap();

    conv.set_batch_size(&mut ctx, 3).unwrap();
    input.set_input(&[1.0; 48]).unwrap();
    conv.forward(&mut ctx, &input).unwrap();
    let three = conv.output(&mut ctx).unwrap().to_vec();
    assert_eq!(three.len(), 12);

    conv.set_batch_size(&mut ctx, 1).unwrap();
    input.set_input(&[1.0; 16]).unwrap();
    conv.forward(&mut ctx, &input).unwrap();
    assert_eq!(conv.output(&mut ctx).unwrap(), &three[..4]);
    assert_eq!(conv.output_allocations(), 1);
}

#[test]
fn too_few_upstream_examples_are_rejected() {
    let mut ctx = Context::host();
    let mut input = InputLayer::new(1, 4).unwrap();
    let mut conv = ConvLayerConfig::default().build(&mut ctx, &input).unwrap();
    conv.set_batch_size(&mut ctx, 2).unwrap();
    input.set_input(&[1.0; 16]).unwrap();
    assert!(conv.forward(&mut ctx, &input).is_err());
    assert_eq!(ctx.live_mirrors(), 3);
}

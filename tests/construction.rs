use briny_conv::conv::ConvLayerConfig;
use briny_conv::dims::LayerDimensions;
use briny_conv::layer::InputLayer;
use briny_conv::sync::Context;
use briny_conv::ConvError;

#[test]
fn even_filters_cannot_be_padded() {
    let mut ctx = Context::host();
    let input = InputLayer::new(1, 8).unwrap();
    let padded = ConvLayerConfig::default()
        .filter_size(4)
        .pad_zeros(true)
        .build(&mut ctx, &input);
    assert_eq!(
        padded.unwrap_err(),
        ConvError::EvenFilterWithPadding { filter_size: 4 }
    );

    let plain = ConvLayerConfig::default()
        .filter_size(4)
        .pad_zeros(false)
        .build(&mut ctx, &input)
        .unwrap();
    assert_eq!(plain.output_board_size(), 5);
}

#[test]
fn filters_larger_than_the_board_are_rejected() {
    let err = LayerDimensions::new(3, 5, 2, 6, false, true).unwrap_err();
    assert_eq!(
        err,
        ConvError::FilterTooLarge {
            filter_size: 6,
            upstream_board_size: 5
        }
    );
    assert!(err.to_string().contains("6 > 5"));
}

#[test]
fn zero_sizes_are_configuration_errors() {
    assert!(matches!(
        LayerDimensions::new(1, 5, 0, 3, false, true),
        Err(ConvError::InvalidConfig(_))
    ));
    assert!(matches!(
        LayerDimensions::new(1, 5, 1, 0, false, true),
        Err(ConvError::InvalidConfig(_))
    ));

    let mut ctx = Context::host();
    let input = InputLayer::new(1, 5).unwrap();
    let mut conv = ConvLayerConfig::default().build(&mut ctx, &input).unwrap();
    assert!(matches!(
        conv.set_batch_size(&mut ctx, 0),
        Err(ConvError::InvalidConfig(_))
    ));
}

#[test]
fn filter_as_large_as_the_board_gives_a_single_cell() {
    let dims = LayerDimensions::new(2, 7, 3, 7, false, false).unwrap();
    assert_eq!(dims.output_board_size(), 1);
    assert_eq!(dims.bias_size(), 0);
    assert_eq!(dims.weights_size(), 3 * 2 * 49);
}

//! Host reference implementation.
//!
//! Plain nested loops over the same index arithmetic the kernels use, with
//! no work-groups, scratch or parallelism. Used to verify the accelerated
//! paths. Upstream errors are computed here as a scatter from each output
//! cell, the kernels compute them as a clipped gather per upstream cell.

use super::weights::learning_multiplier;
use crate::activation::ActivationFunction;
use crate::dims::LayerDimensions;

/// Output activations, `batch_size × outputCube` long.
#[must_use]
pub fn forward(
    dims: &LayerDimensions,
    activation: &dyn ActivationFunction,
    batch_size: usize,
    images: &[f32],
    weights: &[f32],
    bias: &[f32],
) -> Vec<f32> {
    let mut output = vec![0.0; batch_size * dims.output_cube_size()];
    for n in 0..batch_size {
        for out_plane in 0..dims.num_filters() {
            for out_row in 0..dims.output_board_size() {
                for out_col in 0..dims.output_board_size() {
                    let mut sum = 0.0;
                    for in_plane in 0..dims.input_planes() {
                        for u in 0..dims.filter_size() {
                            for v in 0..dims.filter_size() {
                                let (Some(r), Some(c)) =
                                    (dims.upstream_coord(out_row, u), dims.upstream_coord(out_col, v))
                                else {
                                    continue;
                                };
                                sum += weights[dims.weight_index(out_plane, in_plane, u, v)]
                                    * images[dims.input_index(n, in_plane, r, c)];
                            }
                        }
                    }
                    if dims.biased() {
                        sum += bias[out_plane];
                    }
                    output[dims.output_index(n, out_plane, out_row, out_col)] =
                        activation.value(sum);
                }
            }
        }
    }
    output
}

/// Weight deltas, already scaled by `-learning_rate / (batch · outBoard²)`.
#[must_use]
pub fn weight_deltas(
    dims: &LayerDimensions,
    activation: &dyn ActivationFunction,
    batch_size: usize,
    learning_rate: f32,
    images: &[f32],
    output: &[f32],
    errors: &[f32],
) -> Vec<f32> {
    let multiplier = learning_multiplier(dims, batch_size, learning_rate);
    let mut deltas = vec![0.0; dims.weights_size()];
    for out_plane in 0..dims.num_filters() {
        for in_plane in 0..dims.input_planes() {
            for u in 0..dims.filter_size() {
                for v in 0..dims.filter_size() {
                    let mut sum = 0.0;
                    for n in 0..batch_size {
                        for out_row in 0..dims.output_board_size() {
                            for out_col in 0..dims.output_board_size() {
                                let (Some(r), Some(c)) =
                                    (dims.upstream_coord(out_row, u), dims.upstream_coord(out_col, v))
                                else {
                                    continue;
                                };
                                let i = dims.output_index(n, out_plane, out_row, out_col);
                                sum += images[dims.input_index(n, in_plane, r, c)]
                                    * activation.derivative(output[i])
                                    * errors[i];
                            }
                        }
                    }
                    deltas[dims.weight_index(out_plane, in_plane, u, v)] = -multiplier * sum;
                }
            }
        }
    }
    deltas
}

/// Bias deltas; empty for unbiased layers.
#[must_use]
pub fn bias_deltas(
    dims: &LayerDimensions,
    activation: &dyn ActivationFunction,
    batch_size: usize,
    learning_rate: f32,
    output: &[f32],
    errors: &[f32],
) -> Vec<f32> {
    let multiplier = learning_multiplier(dims, batch_size, learning_rate);
    let mut deltas = vec![0.0; dims.bias_size()];
    for (out_plane, delta) in deltas.iter_mut().enumerate() {
        let mut sum = 0.0;
        for n in 0..batch_size {
            for out_row in 0..dims.output_board_size() {
                for out_col in 0..dims.output_board_size() {
                    let i = dims.output_index(n, out_plane, out_row, out_col);
                    sum += activation.derivative(output[i]) * errors[i];
                }
            }
        }
        *delta = -multiplier * sum;
    }
    deltas
}

/// Errors for the upstream stage, shaped like its activations.
#[must_use]
pub fn errors_for_upstream(
    dims: &LayerDimensions,
    batch_size: usize,
    weights: &[f32],
    errors: &[f32],
) -> Vec<f32> {
    let mut upstream = vec![0.0; batch_size * dims.input_cube_size()];
    for n in 0..batch_size {
        for out_plane in 0..dims.num_filters() {
            for out_row in 0..dims.output_board_size() {
                for out_col in 0..dims.output_board_size() {
                    let error = errors[dims.output_index(n, out_plane, out_row, out_col)];
                    for in_plane in 0..dims.input_planes() {
                        for u in 0..dims.filter_size() {
                            for v in 0..dims.filter_size() {
                                let (Some(r), Some(c)) =
                                    (dims.upstream_coord(out_row, u), dims.upstream_coord(out_col, v))
                                else {
                                    continue;
                                };
                                upstream[dims.input_index(n, in_plane, r, c)] +=
                                    weights[dims.weight_index(out_plane, in_plane, u, v)] * error;
                            }
                        }
                    }
                }
            }
        }
    }
    upstream
}

/// `values[i] += deltas[i]`.
pub fn update(values: &mut [f32], deltas: &[f32]) {
    for (v, d) in values.iter_mut().zip(deltas) {
        *v += d;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Linear;

    #[test]
    fn forward_of_ones_sums_the_filter() {
        let dims = LayerDimensions::new(1, 4, 1, 3, false, true).unwrap();
        let out = forward(&dims, &Linear, 1, &[1.0; 16], &[0.5; 9], &[0.25]);
        assert_eq!(out, vec![4.75; 4]);
    }

    #[test]
    fn padded_corner_only_sees_the_inner_window() {
        let dims = LayerDimensions::new(1, 3, 1, 3, true, false).unwrap();
        let out = forward(&dims, &Linear, 1, &[1.0; 9], &[1.0; 9], &[]);
        assert_eq!(out, vec![4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]);
    }

    #[test]
    fn upstream_errors_are_the_transposed_convolution() {
        // one 3x3 filter on a 3x3 board: a single output cell
        let dims = LayerDimensions::new(1, 3, 1, 3, false, false).unwrap();
        let weights: Vec<f32> = (1..=9).map(|i| i as f32).collect();
        let up = errors_for_upstream(&dims, 1, &weights, &[2.0]);
        assert_eq!(up, weights.iter().map(|w| w * 2.0).collect::<Vec<_>>());
    }

    #[test]
    fn unbiased_layers_have_no_bias_deltas() {
        let dims = LayerDimensions::new(1, 4, 2, 3, false, false).unwrap();
        assert!(bias_deltas(&dims, &Linear, 1, 0.1, &[0.0; 8], &[1.0; 8]).is_empty());
    }

    #[test]
    fn update_adds_elementwise() {
        let mut values = [1.0, 2.0];
        update(&mut values, &[0.5, -2.0]);
        assert_eq!(values, [1.5, 0.0]);
    }
}

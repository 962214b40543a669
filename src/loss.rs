//! Loss capability used to derive the errors of the last layer.

use core::fmt;

/// Turns outputs and targets into per-element errors and a scalar loss.
///
/// The errors are what [`ConvLayer::backward`](crate::conv::ConvLayer::backward)
/// consumes, i.e. the derivative of the loss with respect to each output.
pub trait Loss: fmt::Debug + Send + Sync {
    /// Writes `d loss / d output` for every element into `errors`.
    fn errors(&self, output: &[f32], expected: &[f32], errors: &mut [f32]);

    /// Scalar loss over the whole batch.
    fn loss(&self, output: &[f32], expected: &[f32]) -> f32;
}

/// `½ Σ (output - expected)²`, whose errors are the plain difference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SquaredError;

impl Loss for SquaredError {
    fn errors(&self, output: &[f32], expected: &[f32], errors: &mut [f32]) {
        for ((e, o), t) in errors.iter_mut().zip(output).zip(expected) {
            *e = o - t;
        }
    }

    fn loss(&self, output: &[f32], expected: &[f32]) -> f32 {
        0.5 * output
            .iter()
            .zip(expected)
            .map(|(o, t)| (o - t) * (o - t))
            .sum::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squared_error_is_the_raw_difference() {
        let mut errors = [0.0; 3];
        SquaredError.errors(&[1.0, 0.5, -1.0], &[0.0, 0.5, 1.0], &mut errors);
        assert_eq!(errors, [1.0, 0.0, -2.0]);
        assert_eq!(SquaredError.loss(&[1.0, 0.5, -1.0], &[0.0, 0.5, 1.0]), 2.5);
    }
}

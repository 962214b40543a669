//! Activation-function capability.
//!
//! An activation is applied inside the forward kernel and its slope is
//! consumed by every backward gradient. Because the kernels are specialised
//! when they are built, an activation exposes both a host evaluation and a
//! WGSL snippet defining `activation(x)` and `activation_derivative(y)`.
//!
//! Derivatives take the *activation output*, not the pre-activation, which is
//! all the backward pass has at hand.

use core::fmt;

/// A pluggable activation function.
pub trait ActivationFunction: fmt::Debug + Send + Sync {
    /// Maps a pre-activation sum to the activation.
    fn value(&self, x: f32) -> f32;

    /// Slope of the activation, expressed in terms of its output `y`.
    fn derivative(&self, y: f32) -> f32;

    /// Name used as a kernel define, e.g. `TANH`.
    fn define_name(&self) -> &'static str;

    /// WGSL source defining `activation` and `activation_derivative`.
    fn wgsl(&self) -> &'static str;
}

/// Identity activation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Linear;

impl ActivationFunction for Linear {
    fn value(&self, x: f32) -> f32 {
        x
    }

    fn derivative(&self, _y: f32) -> f32 {
        1.0
    }

    fn define_name(&self) -> &'static str {
        "LINEAR"
    }

    fn wgsl(&self) -> &'static str {
        "fn activation(x: f32) -> f32 { return x; }\n\
         fn activation_derivative(y: f32) -> f32 { return 1.0; }\n"
    }
}

/// Hyperbolic tangent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tanh;

impl ActivationFunction for Tanh {
    fn value(&self, x: f32) -> f32 {
        x.tanh()
    }

    fn derivative(&self, y: f32) -> f32 {
        1.0 - y * y
    }

    fn define_name(&self) -> &'static str {
        "TANH"
    }

    fn wgsl(&self) -> &'static str {
        "fn activation(x: f32) -> f32 { return tanh(x); }\n\
         fn activation_derivative(y: f32) -> f32 { return 1.0 - y * y; }\n"
    }
}

/// LeCun's scaled tangent, `1.7159 * tanh(0.66667 * x)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScaledTanh;

impl ScaledTanh {
    const OUTER: f32 = 1.7159;
    const INNER: f32 = 0.66667;
}

impl ActivationFunction for ScaledTanh {
    fn value(&self, x: f32) -> f32 {
        Self::OUTER * (Self::INNER * x).tanh()
    }

    fn derivative(&self, y: f32) -> f32 {
        Self::INNER * (Self::OUTER - y * y / Self::OUTER)
    }

    fn define_name(&self) -> &'static str {
        "SCALEDTANH"
    }

    fn wgsl(&self) -> &'static str {
        "fn activation(x: f32) -> f32 { return 1.7159 * tanh(0.66667 * x); }\n\
         fn activation_derivative(y: f32) -> f32 { return 0.66667 * (1.7159 - y * y / 1.7159); }\n"
    }
}

/// Logistic sigmoid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sigmoid;

impl ActivationFunction for Sigmoid {
    fn value(&self, x: f32) -> f32 {
        1.0 / (1.0 + (-x).exp())
    }

    fn derivative(&self, y: f32) -> f32 {
        y * (1.0 - y)
    }

    fn define_name(&self) -> &'static str {
        "SIGMOID"
    }

    fn wgsl(&self) -> &'static str {
        "fn activation(x: f32) -> f32 { return 1.0 / (1.0 + exp(-x)); }\n\
         fn activation_derivative(y: f32) -> f32 { return y * (1.0 - y); }\n"
    }
}

/// Rectified linear unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Relu;

impl ActivationFunction for Relu {
    fn value(&self, x: f32) -> f32 {
        if x > 0.0 { x } else { 0.0 }
    }

    fn derivative(&self, y: f32) -> f32 {
        if y > 0.0 { 1.0 } else { 0.0 }
    }

    fn define_name(&self) -> &'static str {
        "RELU"
    }

    fn wgsl(&self) -> &'static str {
        "fn activation(x: f32) -> f32 { return max(x, 0.0); }\n\
         fn activation_derivative(y: f32) -> f32 { return select(0.0, 1.0, y > 0.0); }\n"
    }
}

//! Named compute kernels.
//!
//! Each kernel is a WGSL compute entry point `main`. Shape parameters are
//! not arguments: they arrive as `const` declarations rendered from the
//! layer's [`KernelOptions`], so a kernel is specialised per layer shape.
//! Scalars travel in a word array at binding 0; buffers follow at bindings
//! `1..` in argument order.

use crate::accel::KernelOptions;
use crate::error::DeviceFault;
use core::fmt::Write as _;

/// Source of a named kernel plus what it needs from its build options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSource {
    /// Kernel entry name, as known to every accelerator.
    pub name: &'static str,
    /// WGSL body, compiled after the generated preamble.
    pub wgsl: &'static str,
    /// Valued defines the kernel reads.
    pub defines: &'static [&'static str],
    /// Whether the kernel calls `activation` or `activation_derivative`.
    pub needs_activation: bool,
}

const SHAPE_DEFINES: &[&str] = &[
    "gUpstreamBoardSize",
    "gUpstreamBoardSizeSquared",
    "gFilterSize",
    "gFilterSizeSquared",
    "gOutBoardSize",
    "gOutBoardSizeSquared",
    "gPadZeros",
    "gNumOutPlanes",
    "gMargin",
    "gHalfFilterSize",
    "gUpstreamNumPlanes",
    "gBiased",
];

/// Scalar/param helpers shared by every kernel.
const COMMON: &str = include_str!("common.wgsl");

/// Forward convolution, one work item per output cell.
pub const CONVOLVE: KernelSource = KernelSource {
    name: "convolve_imagecubes_float2",
    wgsl: include_str!("convolve.wgsl"),
    defines: SHAPE_DEFINES,
    needs_activation: true,
};

/// Weight gradient, one work item per weight.
pub const BACKPROP_WEIGHTS: KernelSource = KernelSource {
    name: "backprop_floats",
    wgsl: include_str!("backprop_weights.wgsl"),
    defines: SHAPE_DEFINES,
    needs_activation: true,
};

/// Weight gradient, one work-group per `(outPlane, inputPlane)` pair with
/// boards staged in scratch.
pub const BACKPROP_WEIGHTS_SCRATCH: KernelSource = KernelSource {
    name: "backprop_floats_withscratch",
    wgsl: include_str!("backprop_weights_scratch.wgsl"),
    defines: SHAPE_DEFINES,
    needs_activation: true,
};

/// Scratch weight gradient that also produces the bias gradient.
pub const BACKPROP_WEIGHTS_SCRATCH_BIAS: KernelSource = KernelSource {
    name: "backprop_floats_withscratch_dobias",
    wgsl: include_str!("backprop_weights_scratch_bias.wgsl"),
    defines: SHAPE_DEFINES,
    needs_activation: true,
};

/// Transposed convolution of output errors against the weights.
pub const CALC_ERRORS_FOR_UPSTREAM: KernelSource = KernelSource {
    name: "calcErrorsForUpstream",
    wgsl: include_str!("calc_errors_for_upstream.wgsl"),
    defines: SHAPE_DEFINES,
    needs_activation: false,
};

/// Bias gradient, one work item per output plane.
pub const BACKPROP_BIAS: KernelSource = KernelSource {
    name: "doBiasBackprop",
    wgsl: include_str!("backprop_bias.wgsl"),
    defines: SHAPE_DEFINES,
    needs_activation: true,
};

/// `values[i] += deltas[i]`.
pub const ADD_IN_PLACE: KernelSource = KernelSource {
    name: "add_in_place",
    wgsl: include_str!("add_in_place.wgsl"),
    defines: &[],
    needs_activation: false,
};

/// Every kernel a convolutional layer builds.
pub const ALL: [KernelSource; 7] = [
    CONVOLVE,
    BACKPROP_WEIGHTS,
    BACKPROP_WEIGHTS_SCRATCH,
    BACKPROP_WEIGHTS_SCRATCH_BIAS,
    CALC_ERRORS_FOR_UPSTREAM,
    BACKPROP_BIAS,
    ADD_IN_PLACE,
];

impl KernelSource {
    /// Checks that `options` carry every define and the activation this
    /// kernel reads.
    ///
    /// # Errors
    ///
    /// [`DeviceFault::Build`] naming the first missing piece.
    pub fn check_options(&self, options: &KernelOptions) -> Result<(), DeviceFault> {
        if let Some(missing) = self.defines.iter().find(|d| options.value(d).is_none()) {
            return Err(self.build_fault(format!("missing define {missing}")));
        }
        if self.needs_activation && options.activation_function().is_none() {
            return Err(self.build_fault("no activation function configured".into()));
        }
        Ok(())
    }

    /// Renders the complete WGSL module for one work-group size.
    ///
    /// # Errors
    ///
    /// [`DeviceFault::Build`] when options are incomplete or a define does
    /// not fit a WGSL `i32`.
    pub fn module_source(
        &self,
        options: &KernelOptions,
        workgroup_size: usize,
    ) -> Result<String, DeviceFault> {
        self.check_options(options)?;
        let mut src = String::with_capacity(self.wgsl.len() + COMMON.len() + 1024);
        for (name, value) in options.values() {
            let value = i32::try_from(value)
                .map_err(|_| self.build_fault(format!("define {name}={value} overflows i32")))?;
            let _ = writeln!(src, "const {name}: i32 = {value};");
        }
        let _ = writeln!(src, "const gWorkgroupSize: u32 = {workgroup_size}u;");
        if let Some(activation) = options.activation_function() {
            src.push_str(activation.wgsl());
        }
        src.push_str(COMMON);
        src.push_str(self.wgsl);
        Ok(src)
    }

    pub(crate) fn build_fault(&self, reason: String) -> DeviceFault {
        DeviceFault::Build {
            kernel: self.name.to_owned(),
            reason,
        }
    }
}

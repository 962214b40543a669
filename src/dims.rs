//! Layer shape descriptor and flat-index arithmetic.
//!
//! All tensors are flat `f32` arrays in row-major order:
//!
//! - weights: `[filterId][inputPlane][filterRow][filterCol]`
//! - activations and errors: `[example][plane][row][col]`
//!
//! `LayerDimensions` is validated on construction and immutable afterwards.

use crate::accel::KernelOptions;
use crate::error::{ConvError, Result};
use core::fmt;

/// Immutable shape descriptor of one convolutional layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerDimensions {
    input_planes: usize,
    input_board_size: usize,
    num_filters: usize,
    filter_size: usize,
    output_board_size: usize,
    pad_zeros: bool,
    biased: bool,
}

impl LayerDimensions {
    /// Validates a shape and derives the output board size.
    ///
    /// # Errors
    ///
    /// - [`ConvError::EvenFilterWithPadding`] when `pad_zeros` is set and
    ///   `filter_size` is even
    /// - [`ConvError::FilterTooLarge`] when the filter exceeds the upstream board
    /// - [`ConvError::InvalidConfig`] for zero-sized planes, boards or filters
    pub fn new(
        input_planes: usize,
        input_board_size: usize,
        num_filters: usize,
        filter_size: usize,
        pad_zeros: bool,
        biased: bool,
    ) -> Result<Self> {
        if input_planes == 0 || num_filters == 0 {
            return Err(ConvError::InvalidConfig(format!(
                "plane counts must be positive (input planes {input_planes}, filters {num_filters})"
            )));
        }
        if input_board_size == 0 || filter_size == 0 {
            return Err(ConvError::InvalidConfig(format!(
                "board and filter sizes must be positive (board {input_board_size}, filter {filter_size})"
            )));
        }
        if pad_zeros && filter_size % 2 == 0 {
            return Err(ConvError::EvenFilterWithPadding { filter_size });
        }
        if filter_size > input_board_size {
            return Err(ConvError::FilterTooLarge {
                filter_size,
                upstream_board_size: input_board_size,
            });
        }

        let output_board_size = if pad_zeros {
            input_board_size
        } else {
            input_board_size - filter_size + 1
        };

        Ok(Self {
            input_planes,
            input_board_size,
            num_filters,
            filter_size,
            output_board_size,
            pad_zeros,
            biased,
        })
    }

    /// Number of upstream planes.
    #[inline]
    pub const fn input_planes(&self) -> usize {
        self.input_planes
    }

    /// Edge length of the upstream board.
    #[inline]
    pub const fn input_board_size(&self) -> usize {
        self.input_board_size
    }

    /// Number of filters, which is also the number of output planes.
    #[inline]
    pub const fn num_filters(&self) -> usize {
        self.num_filters
    }

    /// Filter edge length.
    #[inline]
    pub const fn filter_size(&self) -> usize {
        self.filter_size
    }

    /// Edge length of the output board.
    #[inline]
    pub const fn output_board_size(&self) -> usize {
        self.output_board_size
    }

    /// Whether the upstream board is zero-padded so the output keeps its size.
    #[inline]
    pub const fn pad_zeros(&self) -> bool {
        self.pad_zeros
    }

    /// Whether each filter carries a bias.
    #[inline]
    pub const fn biased(&self) -> bool {
        self.biased
    }

    /// Weights per filter plane.
    #[inline]
    pub const fn filter_size_squared(&self) -> usize {
        self.filter_size * self.filter_size
    }

    /// Cells per input plane.
    #[inline]
    pub const fn input_board_size_squared(&self) -> usize {
        self.input_board_size * self.input_board_size
    }

    /// Cells per output plane.
    #[inline]
    pub const fn output_board_size_squared(&self) -> usize {
        self.output_board_size * self.output_board_size
    }

    /// `filter_size / 2`, rounded down.
    #[inline]
    pub const fn half_filter_size(&self) -> usize {
        self.filter_size / 2
    }

    /// Offset that centres the filter over an output cell; zero without padding.
    #[inline]
    pub const fn margin(&self) -> usize {
        if self.pad_zeros {
            self.half_filter_size()
        } else {
            0
        }
    }

    /// Element count of the weight tensor.
    #[inline]
    pub const fn weights_size(&self) -> usize {
        self.num_filters * self.input_planes * self.filter_size_squared()
    }

    /// Element count of the bias vector; zero for unbiased layers.
    #[inline]
    pub const fn bias_size(&self) -> usize {
        if self.biased { self.num_filters } else { 0 }
    }

    /// Elements per example on the upstream side.
    #[inline]
    pub const fn input_cube_size(&self) -> usize {
        self.input_planes * self.input_board_size_squared()
    }

    /// Elements per example on the output side.
    #[inline]
    pub const fn output_cube_size(&self) -> usize {
        self.num_filters * self.output_board_size_squared()
    }

    /// Flat index into the weight tensor.
    #[inline]
    pub const fn weight_index(
        &self,
        filter_id: usize,
        input_plane: usize,
        filter_row: usize,
        filter_col: usize,
    ) -> usize {
        ((filter_id * self.input_planes + input_plane) * self.filter_size + filter_row)
            * self.filter_size
            + filter_col
    }

    /// Flat index into an upstream activation (or upstream error) tensor.
    #[inline]
    pub const fn input_index(&self, example: usize, plane: usize, row: usize, col: usize) -> usize {
        activation_index(self.input_planes, self.input_board_size, example, plane, row, col)
    }

    /// Flat index into this layer's output activation (or error) tensor.
    #[inline]
    pub const fn output_index(&self, example: usize, plane: usize, row: usize, col: usize) -> usize {
        activation_index(self.num_filters, self.output_board_size, example, plane, row, col)
    }

    /// Maps an output coordinate plus filter offset to the upstream coordinate.
    ///
    /// Returns `None` when the position falls into the zero padding.
    #[inline]
    pub const fn upstream_coord(&self, out_coord: usize, filter_offset: usize) -> Option<usize> {
        let shifted = out_coord + filter_offset;
        let margin = self.margin();
        if shifted < margin {
            return None;
        }
        let coord = shifted - margin;
        if coord < self.input_board_size {
            Some(coord)
        } else {
            None
        }
    }

    /// Renders the shape as compile-time style kernel defines.
    pub fn kernel_options(&self) -> KernelOptions {
        let mut options = KernelOptions::new();
        options
            .define("gUpstreamBoardSize", self.input_board_size)
            .define("gUpstreamBoardSizeSquared", self.input_board_size_squared())
            .define("gFilterSize", self.filter_size)
            .define("gFilterSizeSquared", self.filter_size_squared())
            .define("gOutBoardSize", self.output_board_size)
            .define("gOutBoardSizeSquared", self.output_board_size_squared())
            .define("gPadZeros", usize::from(self.pad_zeros))
            .define("gNumOutPlanes", self.num_filters)
            .define("gMargin", self.margin())
            .define("gHalfFilterSize", self.half_filter_size())
            .define("gUpstreamNumPlanes", self.input_planes)
            .define("gBiased", usize::from(self.biased));
        options
    }
}

/// Flat index of `(example, plane, row, col)` for a tensor of `planes` boards
/// of edge `board_size`.
#[inline]
pub const fn activation_index(
    planes: usize,
    board_size: usize,
    example: usize,
    plane: usize,
    row: usize,
    col: usize,
) -> usize {
    ((example * planes + plane) * board_size + row) * board_size + col
}

impl fmt::Display for LayerDimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LayerDimensions{{ inputPlanes={} inputBoardSize={} numFilters={} filterSize={} \
             outputBoardSize={} padZeros={} biased={} }}",
            self.input_planes,
            self.input_board_size,
            self.num_filters,
            self.filter_size,
            self.output_board_size,
            self.pad_zeros,
            self.biased
        )
    }
}

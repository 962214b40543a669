//! What a convolutional layer needs from the stage feeding it.

use crate::dims::activation_index;
use crate::error::{ConvError, Result};
use crate::sync::MirrorHandle;

/// Where an upstream stage keeps its activations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpstreamActivations<'a> {
    /// A persistent device mirror owned by the upstream stage.
    Resident(MirrorHandle),
    /// A host array; the consumer binds a transient mirror for it.
    Host(&'a [f32]),
}

/// A stage whose activations feed a convolutional layer.
pub trait Upstream {
    /// Number of planes it emits.
    fn output_planes(&self) -> usize;

    /// Edge length of each emitted board.
    fn output_board_size(&self) -> usize;

    /// Current activations.
    fn activations(&self) -> UpstreamActivations<'_>;

    /// The persistent device mirror, when the stage keeps one.
    fn device_output(&self) -> Option<MirrorHandle> {
        match self.activations() {
            UpstreamActivations::Resident(handle) => Some(handle),
            UpstreamActivations::Host(_) => None,
        }
    }

    /// Flat index of `(example, plane, row, col)` in its activations.
    fn output_index(&self, example: usize, plane: usize, row: usize, col: usize) -> usize {
        activation_index(
            self.output_planes(),
            self.output_board_size(),
            example,
            plane,
            row,
            col,
        )
    }
}

/// Host-side input boards, the head of a layer chain.
#[derive(Debug, Clone, PartialEq)]
pub struct InputLayer {
    planes: usize,
    board_size: usize,
    data: Vec<f32>,
}

impl InputLayer {
    /// Input of `planes` boards of edge `board_size`, initially empty.
    ///
    /// # Errors
    ///
    /// [`ConvError::InvalidConfig`] for zero planes or board size.
    pub fn new(planes: usize, board_size: usize) -> Result<Self> {
        if planes == 0 || board_size == 0 {
            return Err(ConvError::InvalidConfig(format!(
                "input needs positive planes and board size (planes {planes}, board {board_size})"
            )));
        }
        Ok(Self {
            planes,
            board_size,
            data: Vec::new(),
        })
    }

    /// Elements per example.
    #[must_use]
    pub const fn cube_size(&self) -> usize {
        self.planes * self.board_size * self.board_size
    }

    /// Number of examples currently held.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.data.len() / self.cube_size()
    }

    /// Replaces the held examples.
    ///
    /// # Errors
    ///
    /// [`ConvError::LengthMismatch`] when `data` is not a whole number of
    /// examples.
    pub fn set_input(&mut self, data: &[f32]) -> Result<()> {
        let cube = self.cube_size();
        if data.len() % cube != 0 {
            return Err(ConvError::LengthMismatch {
                what: "input",
                expected: data.len().div_ceil(cube) * cube,
                got: data.len(),
            });
        }
        self.data.clear();
        self.data.extend_from_slice(data);
        Ok(())
    }

    /// The held examples.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

impl Upstream for InputLayer {
    fn output_planes(&self) -> usize {
        self.planes
    }

    fn output_board_size(&self) -> usize {
        self.board_size
    }

    fn activations(&self) -> UpstreamActivations<'_> {
        UpstreamActivations::Host(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_layer_exposes_no_device_mirror() {
        let mut input = InputLayer::new(2, 3).unwrap();
        input.set_input(&[0.5; 36]).unwrap();
        assert_eq!(input.batch_size(), 2);
        assert_eq!(input.device_output(), None);
        assert_eq!(input.output_index(1, 1, 2, 2), 35);
        assert!(matches!(input.activations(), UpstreamActivations::Host(d) if d.len() == 36));
    }

    #[test]
    fn partial_examples_are_rejected() {
        let mut input = InputLayer::new(1, 4).unwrap();
        let err = input.set_input(&[0.0; 20]).unwrap_err();
        assert_eq!(
            err,
            ConvError::LengthMismatch {
                what: "input",
                expected: 32,
                got: 20
            }
        );
        assert!(InputLayer::new(0, 4).is_err());
    }
}

//! Shape contracts of layer inputs.

use std::collections::BTreeMap;

use displaydoc::Display;
use thiserror::Error;

/// The input is incompatible with the shape the layer was built for.
#[derive(Debug, Display, Error, PartialEq)]
pub enum IncompatibleInput {
    /// Expected input with {expected} dimensions, got input of shape {shape:?}
    Rank { expected: usize, shape: Vec<usize> },
    /// Expected axis {axis} of input to have size {expected}, got input of shape {shape:?}
    AxisSize {
        axis: usize,
        expected: usize,
        shape: Vec<usize>,
    },
}

/// Rank and per-axis sizes an input must have.
///
/// Axes without an entry are wildcards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputSpec {
    ndim: usize,
    axes: BTreeMap<usize, usize>,
}

impl InputSpec {
    /// Creates a spec for inputs with `ndim` dimensions and given `(axis, size)` constraints.
    ///
    /// # Panics
    ///
    /// If a constrained axis is not below `ndim`.
    pub fn new(ndim: usize, axes: impl IntoIterator<Item = (usize, usize)>) -> Self {
        let axes = axes.into_iter().collect::<BTreeMap<_, _>>();
        if let Some(&axis) = axes.keys().find(|&&axis| axis >= ndim) {
            panic!(
                "can't constrain axis {} of inputs with {} dimensions",
                axis, ndim
            );
        }
        Self { ndim, axes }
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    /// The constrained axes mapped to their required size.
    pub fn axes(&self) -> &BTreeMap<usize, usize> {
        &self.axes
    }

    /// Checks a concrete input shape.
    pub fn check(&self, shape: &[usize]) -> Result<(), IncompatibleInput> {
        if shape.len() != self.ndim {
            return Err(IncompatibleInput::Rank {
                expected: self.ndim,
                shape: shape.to_vec(),
            });
        }

        for (&axis, &expected) in &self.axes {
            if shape[axis] != expected {
                return Err(IncompatibleInput::AxisSize {
                    axis,
                    expected,
                    shape: shape.to_vec(),
                });
            }
        }

        Ok(())
    }

    /// Checks a partially known input shape, unknown sizes are accepted.
    pub fn check_partial(&self, shape: &[Option<usize>]) -> Result<(), IncompatibleInput> {
        // unknown sizes are reported as 0
        let as_reported = || shape.iter().map(|dim| dim.unwrap_or(0)).collect();
        if shape.len() != self.ndim {
            return Err(IncompatibleInput::Rank {
                expected: self.ndim,
                shape: as_reported(),
            });
        }

        for (&axis, &expected) in &self.axes {
            if matches!(shape[axis], Some(size) if size != expected) {
                return Err(IncompatibleInput::AxisSize {
                    axis,
                    expected,
                    shape: as_reported(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> InputSpec {
        InputSpec::new(4, vec![(1, 3), (3, 2)])
    }

    #[test]
    fn test_accepts_matching_shapes() {
        spec().check(&[10, 3, 7, 2]).unwrap();
        spec().check(&[1, 3, 1, 2]).unwrap();
        spec().check_partial(&[None, Some(3), None, Some(2)]).unwrap();
        spec().check_partial(&[None, None, None, None]).unwrap();
    }

    #[test]
    fn test_rejects_wrong_rank() {
        assert_eq!(
            spec().check(&[10, 3, 2]),
            Err(IncompatibleInput::Rank {
                expected: 4,
                shape: vec![10, 3, 2]
            })
        );
        assert!(spec().check_partial(&[None, Some(3)]).is_err());
    }

    #[test]
    fn test_rejects_wrong_axis_size() {
        let error = spec().check(&[10, 4, 7, 2]).unwrap_err();
        assert_eq!(
            error,
            IncompatibleInput::AxisSize {
                axis: 1,
                expected: 3,
                shape: vec![10, 4, 7, 2]
            }
        );
        assert_eq!(
            error.to_string(),
            "Expected axis 1 of input to have size 3, got input of shape [10, 4, 7, 2]"
        );
        assert!(spec()
            .check_partial(&[None, Some(3), None, Some(1)])
            .is_err());
    }

    #[test]
    #[should_panic(expected = "can't constrain axis 4 of inputs with 4 dimensions")]
    fn test_new_panics_on_axis_out_of_range() {
        InputSpec::new(4, vec![(1, 3), (4, 2)]);
    }
}

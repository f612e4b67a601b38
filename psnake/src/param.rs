//! Trainable parameters of a layer.

use std::mem;

use displaydoc::Display;
use ndarray::{ArrayD, ArrayViewD};
use thiserror::Error;

use crate::{constraint::Constraint, regularizer::Regularizer};

/// Can't assign a value of shape {got:?} to parameter {name} of shape {expected:?}
#[derive(Debug, Display, Error, PartialEq)]
pub struct IncompatibleShape {
    name: String,
    expected: Vec<usize>,
    got: Vec<usize>,
}

/// A named parameter array together with its penalty term and projection.
///
/// The shape of the value is fixed on creation.
#[derive(Clone, Debug)]
pub struct Parameter {
    name: String,
    value: ArrayD<f32>,
    regularizer: Option<Regularizer>,
    constraint: Option<Constraint>,
}

impl Parameter {
    pub fn new(
        name: impl Into<String>,
        value: ArrayD<f32>,
        regularizer: Option<Regularizer>,
        constraint: Option<Constraint>,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            regularizer,
            constraint,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &ArrayD<f32> {
        &self.value
    }

    pub fn view(&self) -> ArrayViewD<'_, f32> {
        self.value.view()
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    pub fn regularizer(&self) -> Option<&Regularizer> {
        self.regularizer.as_ref()
    }

    pub fn constraint(&self) -> Option<&Constraint> {
        self.constraint.as_ref()
    }

    /// The penalty of the current value, `0` without a regularizer.
    pub fn penalty(&self) -> f32 {
        self.regularizer
            .as_ref()
            .map_or(0., |regularizer| regularizer.penalty(self.value.view()))
    }

    /// The derivative of the penalty wrt. the current value.
    pub fn penalty_gradient(&self) -> Option<ArrayD<f32>> {
        self.regularizer
            .as_ref()
            .map(|regularizer| regularizer.gradient(self.value.view()))
    }

    /// Adds `delta` to the value and then applies the constraint.
    ///
    /// # Panics
    ///
    /// If `delta` can't be broadcast to the shape of the value.
    pub fn update(&mut self, delta: &ArrayD<f32>) {
        self.value += delta;
        if let Some(constraint) = &self.constraint {
            let value = mem::take(&mut self.value);
            self.value = constraint.project(value);
        }
    }

    /// Replaces the value, e.g. with stored weights.
    ///
    /// The constraint is not applied.
    pub fn assign(&mut self, value: ArrayD<f32>) -> Result<(), IncompatibleShape> {
        if value.shape() == self.value.shape() {
            self.value = value;
            Ok(())
        } else {
            Err(IncompatibleShape {
                name: self.name.clone(),
                expected: self.value.shape().to_vec(),
                got: value.shape().to_vec(),
            })
        }
    }
}

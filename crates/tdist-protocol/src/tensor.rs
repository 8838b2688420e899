use serde::{Deserialize, Serialize};

/// Upper bound on the elements a server materializes for one tensor.
pub const MAX_TENSOR_ELEMENTS: usize = 64 * 1024 * 1024;

/// Product of the dimensions, or `None` on overflow.
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
}

/// Dense `f32` tensor in row-major order. A scalar has an empty shape.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl Tensor {
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            values: vec![value],
        }
    }

    pub fn vector(values: Vec<f32>) -> Self {
        Self {
            shape: vec![values.len()],
            values,
        }
    }

    /// Build a tensor filled with `value`, or `None` when the shape holds more
    /// than `limit` elements.
    pub fn filled(shape: Vec<usize>, value: f32, limit: usize) -> Option<Self> {
        let count = element_count(&shape).filter(|count| *count <= limit)?;
        Some(Self {
            shape,
            values: vec![value; count],
        })
    }

    /// Build a tensor from explicit parts, or `None` when the element count
    /// does not match the shape.
    pub fn from_parts(shape: Vec<usize>, values: Vec<f32>) -> Option<Self> {
        let tensor = Self { shape, values };
        tensor.is_consistent().then_some(tensor)
    }

    /// Element count implied by the shape; `None` when it overflows.
    pub fn num_elements(&self) -> Option<usize> {
        element_count(&self.shape)
    }

    pub fn is_consistent(&self) -> bool {
        self.num_elements() == Some(self.values.len())
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    pub fn as_scalar(&self) -> Option<f32> {
        if self.is_scalar() {
            self.values.first().copied()
        } else {
            None
        }
    }
}

impl From<f32> for Tensor {
    fn from(value: f32) -> Self {
        Self::scalar(value)
    }
}

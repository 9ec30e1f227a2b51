// SPDX-License-Identifier: AGPL-3.0-only

//! The immutable input vector of one pipeline run.

use std::sync::Arc;

use crate::error::{Result, SoftmaxError};

/// Low/high values of the demo input: even positions 1.5, odd positions 3.4.
pub const DEMO_VALUES: (f32, f32) = (1.5, 3.4);

/// Demo length: an 8 × 8 × 8 volume flattened.
pub const DEMO_LEN: usize = 8 * 8 * 8;

/// Finite, non-empty f32 sequence. Cheap to clone; never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct InputVector {
    values: Arc<[f32]>,
}

impl InputVector {
    /// Wrap `values`.
    ///
    /// # Errors
    ///
    /// Returns [`SoftmaxError::InvalidInput`] for an empty vector or one with
    /// a NaN or infinite element.
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() {
            return Err(SoftmaxError::InvalidInput("vector is empty".into()));
        }
        if let Some((i, v)) = values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(SoftmaxError::InvalidInput(format!(
                "element {i} is {v}, softmax needs finite values"
            )));
        }
        Ok(Self {
            values: values.into(),
        })
    }

    /// `len` values alternating `low`, `high`, `low`, … starting with `low`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Self::new`].
    pub fn alternating(len: usize, low: f32, high: f32) -> Result<Self> {
        Self::new(
            (0..len)
                .map(|i| if i % 2 == 0 { low } else { high })
                .collect(),
        )
    }

    /// The demo input of `len` elements.
    ///
    /// # Errors
    ///
    /// Returns [`SoftmaxError::InvalidInput`] if `len` is zero.
    pub fn demo(len: usize) -> Result<Self> {
        Self::alternating(len, DEMO_VALUES.0, DEMO_VALUES.1)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Always false; kept for the `len`/`is_empty` pair.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl TryFrom<Vec<f32>> for InputVector {
    type Error = SoftmaxError;

    fn try_from(values: Vec<f32>) -> Result<Self> {
        Self::new(values)
    }
}

impl AsRef<[f32]> for InputVector {
    fn as_ref(&self) -> &[f32] {
        self.as_slice()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn empty_rejected() {
        assert!(matches!(
            InputVector::new(vec![]),
            Err(SoftmaxError::InvalidInput(_))
        ));
    }

    #[test]
    fn non_finite_rejected_with_index() {
        let err = InputVector::new(vec![1.0, f32::INFINITY]).unwrap_err();
        assert!(err.to_string().contains("element 1"));
        assert!(InputVector::new(vec![f32::NAN]).is_err());
    }

    #[test]
    fn demo_alternates_from_low() {
        let v = InputVector::demo(DEMO_LEN).unwrap();
        assert_eq!(v.len(), 512);
        assert_eq!(v.as_slice()[0], 1.5);
        assert_eq!(v.as_slice()[1], 3.4);
        assert_eq!(v.as_slice()[511], 3.4);
        assert!(!v.is_empty());
    }

    #[test]
    fn clones_share_storage() {
        let v = InputVector::try_from(vec![1.0, 2.0]).unwrap();
        let w = v.clone();
        assert_eq!(v.as_slice().as_ptr(), w.as_slice().as_ptr());
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Datapoint value transformation.
//!
//! A [`ValueTransform`] is an injected pure `f64 -> f64` mapping. It may
//! refuse a value by returning [`TransformError`]; the point is then skipped
//! and reported, and the rest of the timeseries continues. A non-finite
//! result is treated as a refusal.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Why a transformation refused a value.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct TransformError(pub String);

impl TransformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

type TransformFn = dyn Fn(f64) -> Result<f64, TransformError> + Send + Sync;

/// Shared, cheaply clonable value transformation.
#[derive(Clone)]
pub struct ValueTransform {
    func: Arc<TransformFn>,
}

impl ValueTransform {
    /// Wrap a fallible mapping.
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(f64) -> Result<f64, TransformError> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
        }
    }

    /// Wrap an infallible mapping.
    pub fn infallible<F>(func: F) -> Self
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        Self::new(move |x| Ok(func(x)))
    }

    /// `x -> x * factor`
    pub fn scale(factor: f64) -> Self {
        Self::infallible(move |x| x * factor)
    }

    /// `x -> x * factor + offset`
    pub fn linear(factor: f64, offset: f64) -> Self {
        Self::infallible(move |x| x * factor + offset)
    }

    pub fn apply(&self, value: f64) -> Result<f64, TransformError> {
        let out = (self.func)(value)?;
        if out.is_finite() {
            Ok(out)
        } else {
            Err(TransformError(format!("non-finite result {out} for input {value}")))
        }
    }
}

impl fmt::Debug for ValueTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ValueTransform(..)")
    }
}

//! A [`Series`] is the evaluator's unit of output (spec §4.C): an element
//! type plus a column array of a schema-homogeneous run. `eval` is called
//! once per incoming [`flux_core::TableSlice`], each of which is internally
//! homogeneous by construction (spec §3.3); the "iterable<series>" the spec
//! describes is realized by the caller mapping `eval` over the stream of
//! slices, not by this function iterating internally.

use std::sync::Arc;

use datafusion::arrow::array::ArrayRef;

use flux_core::value::Type;

#[derive(Debug, Clone)]
pub struct Series {
    pub ty: Type,
    pub array: ArrayRef,
}

impl Series {
    pub fn new(ty: Type, array: ArrayRef) -> Self {
        Self { ty, array }
    }

    pub fn len(&self) -> usize {
        self.array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty()
    }
}

/// Clones an [`ArrayRef`], matching Arrow's cheap `Arc`-backed clone
/// semantics for slices (spec §3.5: slices and their columns are shared,
/// immutable, reference-counted values).
pub fn share(array: &ArrayRef) -> ArrayRef {
    Arc::clone(array)
}

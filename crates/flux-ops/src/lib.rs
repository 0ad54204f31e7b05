//! # flux-ops
//!
//! Built-in [`flux_core::Operator`] implementations: the handful of stages
//! every pipeline can compose without reaching for a plugin (spec §6.1
//! footnote: "`flux-ops` supplies two concrete, in-scope connectors...purely
//! to exercise the bytes element kind end-to-end").
//!
//! - [`batch`]: coalesces events into fixed-size (or timeout-flushed) slices.
//! - [`select`]: column projection (`select_columns`, spec §4.B).
//! - [`filter`]: row filtering against a [`flux_expr::Expr`] predicate.
//! - [`flatten`]: nested-record hoisting (spec §4.B).
//! - [`group`]: grouping aggregation with a small built-in function registry.
//! - [`fork`]: fans a stream out to multiple sink-terminated sub-pipelines
//!   (spec §2 DAG composition).
//! - [`passthrough`]: the identity operator, for testing pipeline wiring.
//! - [`connectors`]: file and stdio byte sources/sinks.

pub mod batch;
pub mod connectors;
pub mod filter;
pub mod flatten;
pub mod fork;
pub mod group;
pub mod passthrough;
pub mod select;

pub use batch::Batch;
pub use filter::Where;
pub use flatten::Flatten;
pub use fork::Fork;
pub use group::{AggregateFunction, Group};
pub use passthrough::Passthrough;
pub use select::Select;

//! File and stdio byte connectors (spec §6.1 footnote): two concrete,
//! in-scope sources/sinks that exercise the `Bytes` [`flux_core::operator::ElementKind`]
//! end-to-end. Grounded in the teacher's `rde-io` source/sink split
//! (`source_csv.rs`, `sink_stdout.rs`) generalized to raw bytes rather than
//! already-decoded batches, since decoding is a format-plugin concern this
//! crate does not implement.

pub mod file;
pub mod stdio;

pub use file::{FileSink, FileSource};
pub use stdio::{StdioSink, StdioSource};

//! # flux-exec
//!
//! Turns a declared chain of operators into a running pipeline: [`compose`]
//! type-checks and optimizes it, [`schedule`] spawns and wires the cooperative
//! task graph that runs it, [`checkpoint`] gives it at-least-once recovery,
//! and [`cache`] is the process-wide single-flight cache shared across every
//! pipeline in the process (spec §4.E-§4.G, §5). [`registry`] is the plugin
//! registration contract (§6.1) a host binary assembles before composing.

pub mod cache;
pub mod checkpoint;
pub mod compose;
pub mod registry;
pub mod schedule;

pub use cache::ProcessCache;
pub use checkpoint::CheckpointCoordinator;
pub use compose::{compose, ComposedPipeline, CompoundOperator};
pub use registry::{
    AggregateFunctionFactory, AggregateState, Aspect, ConnectorFactory, OperatorFactory, Registry, ScalarFunctionFactory,
};
pub use schedule::{spawn, ExecutorConfig, PipelineHandle, SnapshotReport};

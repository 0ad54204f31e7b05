//! Plugin registration contract (spec §6.1): the four kinds of thing a
//! plugin may contribute to a running process, and the registry a host
//! binary assembles them into before composing a pipeline.
//!
//! The surface query language that would parse a plugin-contributed
//! operator invocation out of source text is out of scope (see
//! `bins/flux-cli/src/config.rs`'s own doc comment), so a factory's "parse
//! hook" here takes the same already-parsed shape the CLI's YAML config
//! takes: an opaque `serde_json::Value` standing in for a parsed AST node.
//! A real TQL front end would produce that value from source text; this
//! core only needs to agree on the handoff point.

use std::collections::HashMap;
use std::sync::Arc;

use flux_core::value::Value;
use flux_core::{ElementKind, Operator};
use flux_expr::Series;

use flux_core::error::{ErrorKind, PipelineError, Result};

/// Registers an operator under a name, building an instance from a parsed
/// configuration node (spec §6.1: "name, parse hook (TQL AST -> operator
/// instance), input_kind/output_kind, and the lifecycle operations of
/// §4.D" — the lifecycle operations are simply `Operator` itself).
pub trait OperatorFactory: Send + Sync {
    /// The name a pipeline declaration uses to refer to this operator kind.
    fn name(&self) -> &str;

    /// The element kind instances of this operator consume/produce before
    /// any config-specific narrowing; used for early diagnostics ahead of
    /// a full `build`.
    fn input_kind(&self) -> ElementKind;
    fn output_kind(&self) -> ElementKind;

    /// Parses `config` and builds a concrete operator instance.
    fn build(&self, config: &serde_json::Value) -> Result<Box<dyn Operator>>;
}

/// An aggregation function plugin (spec §6.1 footnote): `init`, fed one
/// value per grouped row via `update`, and read back via `finish`. Mirrors
/// the shape `flux_ops::group::AggregateFunction` implements for the
/// built-in `all`/`count` aggregates, just exposed here as the contract a
/// plugin author (rather than this core) would implement.
pub trait AggregateFunctionFactory: Send + Sync {
    fn name(&self) -> &str;
    fn init(&self) -> Box<dyn AggregateState>;
}

/// The running accumulator state one group's worth of input folds into.
pub trait AggregateState: Send {
    fn update(&mut self, value: &Value);
    fn finish(&self) -> Value;
    fn save(&self) -> Result<Vec<u8>>;
    fn restore(&mut self, blob: &[u8]) -> Result<()>;
}

/// A scalar function plugin: evaluates eagerly over a batch of columnar
/// arguments and returns one column of results, the same "one `Series` per
/// schema-homogeneous run" shape `flux_expr::eval` produces for built-in
/// operators.
pub trait ScalarFunctionFactory: Send + Sync {
    fn name(&self) -> &str;
    fn eval(&self, args: &[Series]) -> Result<Series>;
}

/// A connector plugin: claims one or more URI schemes and builds a bytes
/// source or sink for a URI under one of them. `flux_ops::connectors`
/// supplies the two in-scope connectors (`file`, `stdio`) directly as
/// built-in operators rather than through this registry, since they exist
/// only to exercise the bytes element kind end-to-end; a real deployment's
/// format- and protocol-specific connectors would register here instead.
pub trait ConnectorFactory: Send + Sync {
    /// The URI schemes this connector claims, e.g. `["file"]` or `["s3"]`.
    fn schemes(&self) -> &[&str];

    fn open_source(&self, uri: &str) -> Result<Box<dyn Operator>>;
    fn open_sink(&self, uri: &str) -> Result<Box<dyn Operator>>;
}

/// An aspect: a named, on-demand table a pipeline can reference without an
/// explicit source operator (e.g. a process list or a connection table).
/// Declared here as a data-description contract only; no built-in aspect
/// ships in this core.
pub trait Aspect: Send + Sync {
    fn name(&self) -> &str;

    /// Produces a single slice snapshotting the aspect's current contents.
    fn snapshot(&self) -> Result<flux_core::TableSlice>;
}

/// The process-wide collection of registered plugins, keyed by the name
/// each kind is looked up under.
#[derive(Default)]
pub struct Registry {
    operators: HashMap<String, Arc<dyn OperatorFactory>>,
    aggregates: HashMap<String, Arc<dyn AggregateFunctionFactory>>,
    scalars: HashMap<String, Arc<dyn ScalarFunctionFactory>>,
    connectors: HashMap<String, Arc<dyn ConnectorFactory>>,
    aspects: HashMap<String, Arc<dyn Aspect>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_operator(&mut self, factory: Arc<dyn OperatorFactory>) {
        self.operators.insert(factory.name().to_string(), factory);
    }

    pub fn register_aggregate(&mut self, factory: Arc<dyn AggregateFunctionFactory>) {
        self.aggregates.insert(factory.name().to_string(), factory);
    }

    pub fn register_scalar(&mut self, factory: Arc<dyn ScalarFunctionFactory>) {
        self.scalars.insert(factory.name().to_string(), factory);
    }

    /// Registers a connector under every URI scheme it claims. Returns an
    /// error if a scheme is already claimed by another registered connector,
    /// since two connectors racing to open the same scheme is a
    /// configuration mistake, not something to silently shadow.
    pub fn register_connector(&mut self, factory: Arc<dyn ConnectorFactory>) -> Result<()> {
        for scheme in factory.schemes() {
            if self.connectors.contains_key(*scheme) {
                return Err(PipelineError::new(
                    ErrorKind::Configuration,
                    format!("URI scheme `{scheme}` is already claimed by a registered connector"),
                ));
            }
        }
        for scheme in factory.schemes() {
            self.connectors.insert(scheme.to_string(), Arc::clone(&factory));
        }
        Ok(())
    }

    pub fn register_aspect(&mut self, aspect: Arc<dyn Aspect>) {
        self.aspects.insert(aspect.name().to_string(), aspect);
    }

    pub fn operator(&self, name: &str) -> Option<&Arc<dyn OperatorFactory>> {
        self.operators.get(name)
    }

    pub fn aggregate(&self, name: &str) -> Option<&Arc<dyn AggregateFunctionFactory>> {
        self.aggregates.get(name)
    }

    pub fn scalar(&self, name: &str) -> Option<&Arc<dyn ScalarFunctionFactory>> {
        self.scalars.get(name)
    }

    pub fn connector_for_scheme(&self, scheme: &str) -> Option<&Arc<dyn ConnectorFactory>> {
        self.connectors.get(scheme)
    }

    pub fn aspect(&self, name: &str) -> Option<&Arc<dyn Aspect>> {
        self.aspects.get(name)
    }

    /// Builds an operator instance by looking up `kind` and handing its
    /// factory the already-parsed `config`. Returns a `configuration` error
    /// if no factory is registered under that name.
    pub fn build_operator(&self, kind: &str, config: &serde_json::Value) -> Result<Box<dyn Operator>> {
        let factory = self
            .operator(kind)
            .ok_or_else(|| PipelineError::new(ErrorKind::Configuration, format!("no operator registered under `{kind}`")))?;
        factory.build(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flux_core::control::ControlPlane;
    use flux_core::operator::MessageStream;
    use futures::stream;
    use futures::StreamExt;

    struct NoopOperator {
        name: String,
    }

    #[async_trait]
    impl Operator for NoopOperator {
        fn name(&self) -> &str {
            &self.name
        }
        fn input_kind(&self) -> ElementKind {
            ElementKind::Void
        }
        fn output_kind(&self) -> ElementKind {
            ElementKind::Void
        }
        async fn instantiate(&self, _input: MessageStream, _control: ControlPlane) -> Result<MessageStream> {
            Ok(stream::empty().boxed())
        }
    }

    struct NoopFactory;

    impl OperatorFactory for NoopFactory {
        fn name(&self) -> &str {
            "noop"
        }
        fn input_kind(&self) -> ElementKind {
            ElementKind::Void
        }
        fn output_kind(&self) -> ElementKind {
            ElementKind::Void
        }
        fn build(&self, config: &serde_json::Value) -> Result<Box<dyn Operator>> {
            let name = config.get("name").and_then(|v| v.as_str()).unwrap_or("noop").to_string();
            Ok(Box::new(NoopOperator { name }))
        }
    }

    #[test]
    fn builds_a_registered_operator_by_name() {
        let mut registry = Registry::new();
        registry.register_operator(Arc::new(NoopFactory));
        let built = registry.build_operator("noop", &serde_json::json!({"name": "n1"})).unwrap();
        assert_eq!(built.name(), "n1");
    }

    #[test]
    fn unregistered_operator_kind_is_a_configuration_error() {
        let registry = Registry::new();
        let err = registry.build_operator("missing", &serde_json::json!({})).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
    }

    struct FileConnector;

    impl ConnectorFactory for FileConnector {
        fn schemes(&self) -> &[&str] {
            &["file"]
        }
        fn open_source(&self, _uri: &str) -> Result<Box<dyn Operator>> {
            Ok(Box::new(NoopOperator { name: "file_source".to_string() }))
        }
        fn open_sink(&self, _uri: &str) -> Result<Box<dyn Operator>> {
            Ok(Box::new(NoopOperator { name: "file_sink".to_string() }))
        }
    }

    #[test]
    fn rejects_a_second_connector_claiming_the_same_scheme() {
        let mut registry = Registry::new();
        registry.register_connector(Arc::new(FileConnector)).unwrap();
        let err = registry.register_connector(Arc::new(FileConnector)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
    }

    #[test]
    fn looks_up_a_connector_by_scheme() {
        let mut registry = Registry::new();
        registry.register_connector(Arc::new(FileConnector)).unwrap();
        assert!(registry.connector_for_scheme("file").is_some());
        assert!(registry.connector_for_scheme("s3").is_none());
    }
}

//! Declarative pipeline configuration: a YAML document naming an ordered,
//! source-to-sink list of built-in operators. The surface query language
//! that would compile a pipeline script down to this shape is out of scope;
//! this is the wire format the CLI accepts directly.

use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use flux_core::diagnostics::Location;
use flux_core::operator::Operator;
use flux_core::value::Value;
use flux_exec::compose::CompoundOperator;
use flux_expr::ast::{BinaryOp, Expr, FieldPath, UnaryOp};
use flux_ops::connectors::{FileSink, FileSource, StdioSink, StdioSource};
use flux_ops::{Batch, Flatten, Fork, Group, Passthrough, Select, Where};

fn default_pipeline_id() -> String {
    "pipeline".to_string()
}

#[derive(Debug, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_pipeline_id")]
    pub pipeline_id: String,
    pub operators: Vec<OperatorConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperatorConfig {
    FromFile {
        name: String,
        path: String,
    },
    FromStdin {
        name: String,
    },
    ToFile {
        name: String,
        path: String,
    },
    ToStdout {
        name: String,
    },
    Batch {
        name: String,
        limit: usize,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Where {
        name: String,
        predicate: ExprConfig,
    },
    Select {
        name: String,
        paths: Vec<String>,
    },
    Flatten {
        name: String,
        #[serde(default = "default_flatten_sep")]
        sep: String,
    },
    Group {
        name: String,
        key_columns: Vec<String>,
        aggregate: String,
        input_column: String,
        output_column: String,
    },
    Passthrough {
        name: String,
    },
    /// A DAG fan-out: each branch is itself an ordered operator list, run to
    /// completion independently of the others (spec §2, §4.E). Every branch
    /// must end in a sink.
    Fork {
        name: String,
        branches: Vec<Vec<OperatorConfig>>,
    },
}

fn default_flatten_sep() -> String {
    ".".to_string()
}

/// Builds the concrete operator a config entry names. Kept free of any
/// registry indirection: the built-in set is small and closed, so a direct
/// match reads more plainly than a lookup table would.
pub fn build_operator(config: &OperatorConfig) -> anyhow::Result<Box<dyn Operator>> {
    let operator: Box<dyn Operator> = match config {
        OperatorConfig::FromFile { name, path } => Box::new(FileSource::new(name.as_str(), path.as_str())),
        OperatorConfig::FromStdin { name } => Box::new(StdioSource::new(name.as_str())),
        OperatorConfig::ToFile { name, path } => Box::new(FileSink::new(name.as_str(), path.as_str())),
        OperatorConfig::ToStdout { name } => Box::new(StdioSink::new(name.as_str())),
        OperatorConfig::Batch { name, limit, timeout_ms } => {
            Box::new(Batch::new(name.as_str(), *limit, timeout_ms.map(Duration::from_millis)))
        }
        OperatorConfig::Where { name, predicate } => {
            let expr = build_expr(predicate).with_context(|| format!("operator `{name}`"))?;
            Box::new(Where::new(name.as_str(), expr))
        }
        OperatorConfig::Select { name, paths } => Box::new(Select::new(name.as_str(), paths.clone())),
        OperatorConfig::Flatten { name, sep } => Box::new(Flatten::new(name.as_str(), sep.clone())),
        OperatorConfig::Group { name, key_columns, aggregate, input_column, output_column } => Box::new(Group::new(
            name.as_str(),
            key_columns.clone(),
            aggregate.as_str(),
            input_column.as_str(),
            output_column.as_str(),
        )),
        OperatorConfig::Passthrough { name } => Box::new(Passthrough::new(name.as_str())),
        OperatorConfig::Fork { name, branches } => {
            let branches = branches
                .iter()
                .enumerate()
                .map(|(i, branch)| {
                    let ops = branch
                        .iter()
                        .map(build_operator)
                        .collect::<anyhow::Result<_>>()
                        .with_context(|| format!("operator `{name}` branch {i}"))?;
                    CompoundOperator::new(format!("{name}.branch{i}"), ops)
                        .with_context(|| format!("operator `{name}` branch {i}"))
                })
                .collect::<anyhow::Result<_>>()?;
            Box::new(Fork::new(name.as_str(), branches).with_context(|| format!("operator `{name}`"))?)
        }
    };
    Ok(operator)
}

/// A literal scalar a config predicate can embed directly. Temporal, IP,
/// and other non-scalar types have no plain-YAML spelling here; expressing
/// those requires the (out of scope) surface query language's own literal
/// syntax, which produces `flux_expr::ast::Expr` trees the same way this
/// config does, just from richer source text.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum LiteralConfig {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&LiteralConfig> for Value {
    fn from(lit: &LiteralConfig) -> Self {
        match lit {
            LiteralConfig::Null => Value::Null,
            LiteralConfig::Bool(b) => Value::Bool(*b),
            LiteralConfig::Int(i) => Value::Int64(*i),
            LiteralConfig::Float(f) => Value::Double(*f),
            LiteralConfig::Str(s) => Value::String(s.clone()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "expr", rename_all = "snake_case")]
pub enum ExprConfig {
    Literal {
        value: LiteralConfig,
    },
    Field {
        path: String,
    },
    Unary {
        op: String,
        operand: Box<ExprConfig>,
    },
    Binary {
        op: String,
        lhs: Box<ExprConfig>,
        rhs: Box<ExprConfig>,
    },
    /// A byte range pin for diagnostics, carried alongside any of the above.
    #[serde(rename = "located")]
    Located {
        begin: usize,
        end: usize,
        expr: Box<ExprConfig>,
    },
}

pub fn build_expr(config: &ExprConfig) -> anyhow::Result<Expr> {
    let expr = match config {
        ExprConfig::Literal { value } => Expr::literal(Value::from(value)),
        ExprConfig::Field { path } => Expr::field(FieldPath::new(path.split('.'))),
        ExprConfig::Unary { op, operand } => Expr::unary(unary_op(op)?, build_expr(operand)?),
        ExprConfig::Binary { op, lhs, rhs } => Expr::binary(binary_op(op)?, build_expr(lhs)?, build_expr(rhs)?),
        ExprConfig::Located { begin, end, expr } => build_expr(expr)?.with_location(Location::new(*begin, *end)),
    };
    Ok(expr)
}

fn unary_op(op: &str) -> anyhow::Result<UnaryOp> {
    Ok(match op {
        "neg" | "-" => UnaryOp::Neg,
        "not" | "!" => UnaryOp::Not,
        "bitnot" | "~" => UnaryOp::BitNot,
        other => bail!("unknown unary operator `{other}`"),
    })
}

fn binary_op(op: &str) -> anyhow::Result<BinaryOp> {
    Ok(match op {
        "add" | "+" => BinaryOp::Add,
        "sub" | "-" => BinaryOp::Sub,
        "mul" | "*" => BinaryOp::Mul,
        "div" | "/" => BinaryOp::Div,
        "mod" | "%" => BinaryOp::Mod,
        "bitand" | "&" => BinaryOp::BitAnd,
        "bitor" | "|" => BinaryOp::BitOr,
        "bitxor" | "^" => BinaryOp::BitXor,
        "and" | "&&" => BinaryOp::And,
        "or" | "||" => BinaryOp::Or,
        "eq" | "==" => BinaryOp::Eq,
        "ne" | "!=" => BinaryOp::Ne,
        "lt" | "<" => BinaryOp::Lt,
        "le" | "<=" => BinaryOp::Le,
        "gt" | ">" => BinaryOp::Gt,
        "ge" | ">=" => BinaryOp::Ge,
        "in" => BinaryOp::In,
        "match" | "=~" => BinaryOp::Match,
        other => bail!("unknown binary operator `{other}`"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_where_select_pipeline() {
        let yaml = r#"
pipeline_id: drop-small
operators:
  - kind: from_stdin
    name: src
  - kind: where
    name: keep_big
    predicate:
      expr: binary
      op: ">"
      lhs: { expr: field, path: a }
      rhs: { expr: literal, value: 2 }
  - kind: select
    name: project
    paths: ["a"]
  - kind: to_stdout
    name: sink
"#;
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pipeline_id, "drop-small");
        assert_eq!(config.operators.len(), 4);
        for op in &config.operators {
            build_operator(op).unwrap();
        }
    }

    #[test]
    fn rejects_unknown_binary_operator() {
        let expr = ExprConfig::Binary {
            op: "frobnicate".to_string(),
            lhs: Box::new(ExprConfig::Field { path: "a".to_string() }),
            rhs: Box::new(ExprConfig::Literal { value: LiteralConfig::Int(1) }),
        };
        assert!(build_expr(&expr).is_err());
    }

    #[test]
    fn parses_a_forked_pipeline() {
        let yaml = r#"
pipeline_id: fanout
operators:
  - kind: from_stdin
    name: src
  - kind: fork
    name: split
    branches:
      - - kind: to_stdout
          name: sink_a
      - - kind: to_stdout
          name: sink_b
"#;
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.operators.len(), 2);
        for op in &config.operators {
            let built = build_operator(op).unwrap();
            if matches!(op, OperatorConfig::Fork { .. }) {
                assert_eq!(built.output_kind(), flux_core::ElementKind::Void);
            }
        }
    }

    #[test]
    fn defaults_pipeline_id_when_absent() {
        let yaml = r#"
operators:
  - kind: passthrough
    name: p
"#;
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pipeline_id, "pipeline");
    }
}

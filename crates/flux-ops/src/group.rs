//! Grouping aggregation operator (spec §4.B `group`), with a small built-in
//! aggregate-function registry. Blocking by nature (spec §4.B note: "group"
//! cannot emit a group's row until it has seen every event that could still
//! belong to it), so state accumulates across the whole stream and is only
//! emitted at EOS — the one operator in this crate whose `checkpoint_state`
//! is not the trivial empty blob.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use datafusion::arrow::array::{Array, ArrayRef, BooleanArray, UInt64Array};
use datafusion::arrow::compute::take;
use datafusion::arrow::record_batch::RecordBatch;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};

use flux_core::control::ControlPlane;
use flux_core::error::{ErrorKind, PipelineError};
use flux_core::message::Message;
use flux_core::operator::{ElementKind, MessageStream, Operator};
use flux_core::value::Value;
use flux_core::{Result, TableSlice};
use flux_expr::Series;

/// A streaming aggregate function: fed one [`Series`] per batch of rows that
/// belong to its group, and asked for a final [`Value`] at EOS. `save`/
/// `restore` are the checkpoint hooks (spec §4.G): every built-in keeps
/// enough state in its JSON blob to resume without re-scanning prior rows.
pub trait AggregateFunction: Send {
    fn update(&mut self, series: &Series);
    fn finish(&self) -> Value;
    fn save(&self) -> serde_json::Value;
    fn restore(&mut self, state: serde_json::Value);
}

/// Three-valued logical AND over a boolean column: any `false` wins over any
/// `null`, which wins over `true` (spec S5). Starts as `true` (the identity
/// for AND) until a row says otherwise.
#[derive(Default)]
struct AllAggregate {
    seen_false: bool,
    seen_null: bool,
}

impl AggregateFunction for AllAggregate {
    fn update(&mut self, series: &Series) {
        if let Some(array) = series.array.as_any().downcast_ref::<BooleanArray>() {
            for i in 0..array.len() {
                if array.is_null(i) {
                    self.seen_null = true;
                } else if !array.value(i) {
                    self.seen_false = true;
                }
            }
        }
    }

    fn finish(&self) -> Value {
        if self.seen_false {
            Value::Bool(false)
        } else if self.seen_null {
            Value::Null
        } else {
            Value::Bool(true)
        }
    }

    fn save(&self) -> serde_json::Value {
        serde_json::json!({ "seen_false": self.seen_false, "seen_null": self.seen_null })
    }

    fn restore(&mut self, state: serde_json::Value) {
        self.seen_false = state.get("seen_false").and_then(|v| v.as_bool()).unwrap_or(false);
        self.seen_null = state.get("seen_null").and_then(|v| v.as_bool()).unwrap_or(false);
    }
}

/// Counts non-null rows seen.
#[derive(Default)]
struct CountAggregate {
    count: i64,
}

impl AggregateFunction for CountAggregate {
    fn update(&mut self, series: &Series) {
        self.count += (series.len() - series.array.null_count()) as i64;
    }

    fn finish(&self) -> Value {
        Value::Int64(self.count)
    }

    fn save(&self) -> serde_json::Value {
        serde_json::json!({ "count": self.count })
    }

    fn restore(&mut self, state: serde_json::Value) {
        self.count = state.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
    }
}

fn build_aggregate(name: &str) -> Result<Box<dyn AggregateFunction>> {
    match name {
        "all" => Ok(Box::new(AllAggregate::default())),
        "count" => Ok(Box::new(CountAggregate::default())),
        other => Err(PipelineError::new(ErrorKind::Configuration, format!("unknown aggregate function `{other}`"))),
    }
}

struct GroupEntry {
    key: Vec<Value>,
    aggregate: Box<dyn AggregateFunction>,
}

/// `group <key_columns...> aggregate <fn>(<column>) as <output>`. Entries
/// live behind a mutex since [`Operator::instantiate`] only hands out `&self`
/// but the stream that drains EOS needs to mutate accumulated group state.
pub struct Group {
    name: String,
    key_columns: Vec<String>,
    input_column: String,
    aggregate_fn: String,
    output_column: String,
    entries: Mutex<Vec<GroupEntry>>,
}

impl Group {
    pub fn new(
        name: impl Into<String>,
        key_columns: Vec<String>,
        aggregate_fn: impl Into<String>,
        input_column: impl Into<String>,
        output_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            key_columns,
            input_column: input_column.into(),
            aggregate_fn: aggregate_fn.into(),
            output_column: output_column.into(),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn entry_index(&self, entries: &mut Vec<GroupEntry>, key: &[Value]) -> Result<usize> {
        if let Some(i) = entries.iter().position(|e| e.key == key) {
            return Ok(i);
        }
        entries.push(GroupEntry { key: key.to_vec(), aggregate: build_aggregate(&self.aggregate_fn)? });
        Ok(entries.len() - 1)
    }

    fn ingest(&self, batch: &RecordBatch) -> Result<()> {
        let schema = batch.schema();
        let key_indices: Vec<usize> = self
            .key_columns
            .iter()
            .map(|name| {
                schema
                    .index_of(name)
                    .map_err(|_| PipelineError::new(ErrorKind::Configuration, format!("unknown group key column `{name}`")))
            })
            .collect::<Result<_>>()?;
        let input_index = schema.index_of(&self.input_column).map_err(|_| {
            PipelineError::new(ErrorKind::Configuration, format!("unknown aggregate input column `{}`", self.input_column))
        })?;

        let mut entries = self.entries.lock().expect("poisoned");
        let mut groups: HashMap<usize, Vec<u64>> = HashMap::new();
        let mut order: Vec<usize> = Vec::new();
        for row in 0..batch.num_rows() {
            let key: Vec<Value> = key_indices.iter().map(|&ci| scalar_at(batch.column(ci), row)).collect();
            let idx = self.entry_index(&mut entries, &key)?;
            let bucket = groups.entry(idx).or_insert_with(Vec::new);
            if bucket.is_empty() {
                order.push(idx);
            }
            bucket.push(row as u64);
        }

        let input_column: &ArrayRef = batch.column(input_index);
        for idx in order {
            let rows = &groups[&idx];
            let take_indices = UInt64Array::from(rows.clone());
            let taken =
                take(input_column.as_ref(), &take_indices, None).map_err(|e| PipelineError::runtime(format!("group take failed: {e}")))?;
            let ty = flux_core::arrow_mapping::from_arrow_field(schema.field(input_index));
            let series = Series::new(ty, taken);
            entries[idx].aggregate.update(&series);
        }
        Ok(())
    }

    fn finish(&self) -> Result<Option<TableSlice>> {
        let entries = self.entries.lock().expect("poisoned");
        if entries.is_empty() {
            return Ok(None);
        }
        let mut rows: Vec<Vec<(String, Value)>> = Vec::new();
        for entry in entries.iter() {
            let mut record: Vec<(String, Value)> = self.key_columns.iter().cloned().zip(entry.key.iter().cloned()).collect();
            record.push((self.output_column.clone(), entry.aggregate.finish()));
            rows.push(record);
        }
        Ok(Some(records_to_slice(rows)?))
    }
}

/// Pulls a single row out of an Arrow column as a dynamic [`Value`],
/// supporting the handful of primitive types grouping keys and aggregate
/// inputs realistically use (spec §3.1 scalar kinds).
fn scalar_at(array: &ArrayRef, row: usize) -> Value {
    use datafusion::arrow::array::{BooleanArray as BoolArr, Float64Array, Int64Array, StringArray};

    if array.is_null(row) {
        return Value::Null;
    }
    if let Some(a) = array.as_any().downcast_ref::<Int64Array>() {
        return Value::Int64(a.value(row));
    }
    if let Some(a) = array.as_any().downcast_ref::<StringArray>() {
        return Value::String(a.value(row).to_string());
    }
    if let Some(a) = array.as_any().downcast_ref::<BoolArr>() {
        return Value::Bool(a.value(row));
    }
    if let Some(a) = array.as_any().downcast_ref::<Float64Array>() {
        return Value::Double(a.value(row));
    }
    Value::Null
}

fn records_to_slice(rows: Vec<Vec<(String, Value)>>) -> Result<TableSlice> {
    use datafusion::arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    let columns: Vec<String> = rows[0].iter().map(|(name, _)| name.clone()).collect();
    let mut fields = Vec::with_capacity(columns.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());

    for (ci, name) in columns.iter().enumerate() {
        let values: Vec<&Value> = rows.iter().map(|r| &r[ci].1).collect();
        let (data_type, array) = column_from_values(&values);
        fields.push(Field::new(name, data_type, true));
        arrays.push(array);
    }

    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(schema, arrays).map_err(|e| PipelineError::runtime(format!("group output batch: {e}")))?;
    Ok(TableSlice::from_batch(batch))
}

fn column_from_values(values: &[&Value]) -> (datafusion::arrow::datatypes::DataType, ArrayRef) {
    use datafusion::arrow::array::{BooleanArray as BoolArr, Float64Array, Int64Array, StringArray};
    use datafusion::arrow::datatypes::DataType;
    use std::sync::Arc;

    let tag = values.iter().find(|v| !v.is_null()).map(|v| v.tag()).unwrap_or("null");
    match tag {
        "int64" => {
            let a: Int64Array = values
                .iter()
                .map(|v| match v {
                    Value::Int64(n) => Some(*n),
                    _ => None,
                })
                .collect();
            (DataType::Int64, Arc::new(a))
        }
        "bool" => {
            let a: BoolArr = values
                .iter()
                .map(|v| match v {
                    Value::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect();
            (DataType::Boolean, Arc::new(a))
        }
        "double" => {
            let a: Float64Array = values
                .iter()
                .map(|v| match v {
                    Value::Double(d) => Some(*d),
                    _ => None,
                })
                .collect();
            (DataType::Float64, Arc::new(a))
        }
        _ => {
            let a: StringArray = values
                .iter()
                .map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    _ => None,
                })
                .collect();
            (DataType::Utf8, Arc::new(a))
        }
    }
}

#[async_trait]
impl Operator for Group {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_kind(&self) -> ElementKind {
        ElementKind::Events
    }

    fn output_kind(&self) -> ElementKind {
        ElementKind::Events
    }

    async fn instantiate(&self, input: MessageStream, control: ControlPlane) -> Result<MessageStream> {
        let mut input = input;
        let mut out = Vec::new();
        while let Some(msg) = input.next().await {
            match msg {
                Message::Batch(slice) => {
                    if let Err(e) = self.ingest(slice.batch()) {
                        tracing::warn!(operator = %self.name, error = %e, "group failed to ingest batch");
                        control.emit(flux_core::diagnostics::Diagnostic::warning(format!(
                            "group dropped a batch: {e}"
                        )));
                    }
                }
                Message::Barrier(id) => out.push(Message::Barrier(id)),
                Message::Eos => {
                    if let Ok(Some(slice)) = self.finish() {
                        out.push(Message::Batch(slice));
                    }
                    out.push(Message::Eos);
                }
                other => out.push(other),
            }
        }
        Ok(futures::stream::iter(out).boxed())
    }

    fn checkpoint_state(&self) -> Result<Vec<u8>> {
        let entries = self.entries.lock().expect("poisoned");
        let snapshot: Vec<GroupEntrySnapshot> =
            entries.iter().map(|e| GroupEntrySnapshot { key: e.key.clone(), state: e.aggregate.save() }).collect();
        serde_json::to_vec(&GroupSnapshot { entries: snapshot, aggregate_fn: self.aggregate_fn.clone() })
            .map_err(|e| PipelineError::state_corruption(format!("group checkpoint serialize: {e}")))
    }

    fn restore_state(&mut self, state: &[u8]) -> Result<()> {
        let snapshot: GroupSnapshot =
            serde_json::from_slice(state).map_err(|e| PipelineError::state_corruption(format!("group checkpoint deserialize: {e}")))?;
        let mut entries = Vec::with_capacity(snapshot.entries.len());
        for entry in snapshot.entries {
            let mut aggregate = build_aggregate(&snapshot.aggregate_fn)?;
            aggregate.restore(entry.state);
            entries.push(GroupEntry { key: entry.key, aggregate });
        }
        *self.entries.lock().expect("poisoned") = entries;
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct GroupEntrySnapshot {
    key: Vec<Value>,
    state: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct GroupSnapshot {
    aggregate_fn: String,
    entries: Vec<GroupEntrySnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::{BooleanArray as ArrowBooleanArray, StringArray};
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn bool_batch(key: &str, values: Vec<Option<bool>>) -> TableSlice {
        let n = values.len();
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Utf8, true), Field::new("x", DataType::Boolean, true)]));
        let keys = StringArray::from(vec![key; n]);
        let xs = ArrowBooleanArray::from(values);
        let batch = RecordBatch::try_new(schema, vec![Arc::new(keys), Arc::new(xs)]).unwrap();
        TableSlice::from_batch(batch)
    }

    // S5: group by k, aggregate all(x). [true, true] -> true;
    // [true, null] -> null; any false present -> false.
    #[tokio::test]
    async fn s5_three_valued_all_aggregate() {
        let group = Group::new("group", vec!["k".to_string()], "all", "x", "all_x");
        group.ingest(bool_batch("a", vec![Some(true), Some(true)]).batch()).unwrap();
        group.ingest(bool_batch("b", vec![Some(true), None]).batch()).unwrap();
        group.ingest(bool_batch("c", vec![Some(true), Some(false), None]).batch()).unwrap();

        let result = group.finish().unwrap().unwrap();
        let k = result.batch().column(0).as_any().downcast_ref::<StringArray>().unwrap();
        let all_x = result.batch().column(1).as_any().downcast_ref::<ArrowBooleanArray>().unwrap();

        let mut by_key: std::collections::HashMap<String, Option<bool>> = std::collections::HashMap::new();
        for i in 0..result.len() {
            let v = if all_x.is_null(i) { None } else { Some(all_x.value(i)) };
            by_key.insert(k.value(i).to_string(), v);
        }
        assert_eq!(by_key["a"], Some(true));
        assert_eq!(by_key["b"], None);
        assert_eq!(by_key["c"], Some(false));
    }
}

//! Table Slice (spec §3.3, §4.B): the core unit batch moved between
//! operators — a schema plus column-major, immutable data.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use datafusion::arrow::array::{Array, ArrayRef, RecordBatch, StructArray};
use datafusion::arrow::compute::concat_batches;
use datafusion::arrow::datatypes::{DataType, Field as ArrowField, Fields, Schema, SchemaRef};

use crate::error::{ErrorKind, PipelineError, Result};

/// A unit batch: an Arrow schema, column-major data of matching length, and
/// the stream-position metadata from spec §3.3.
#[derive(Debug, Clone)]
pub struct TableSlice {
    batch: RecordBatch,
    /// Import-time metadata (nanoseconds since the Unix epoch).
    import_time: i64,
    /// Stable, monotonically non-decreasing position in the logical stream.
    offset: Option<u64>,
}

impl TableSlice {
    /// Builds a slice from an Arrow batch. `import_time` is nanoseconds
    /// since epoch; `offset` is the slice's position in the logical stream,
    /// if the producer tracks one.
    pub fn new(batch: RecordBatch, import_time: i64, offset: Option<u64>) -> Result<Self> {
        Ok(Self {
            batch,
            import_time,
            offset,
        })
    }

    pub fn from_batch(batch: RecordBatch) -> Self {
        Self {
            batch,
            import_time: 0,
            offset: None,
        }
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn into_batch(self) -> RecordBatch {
        self.batch
    }

    pub fn len(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn import_time(&self) -> i64 {
        self.import_time
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Schemas are the same shape: same field names/types/order. Column
    /// [`DataType`] must equal the schema's nominal field type (enums,
    /// timestamps preserved) per the invariant in spec §3.3 — enforced here
    /// by comparing full Arrow `Schema` equality, which covers data type,
    /// nesting and field name but (deliberately, for this check) not
    /// metadata, since two producers of "the same shape" schema need not
    /// agree on attribute metadata to be batchable together.
    fn same_shape(a: &Schema, b: &Schema) -> bool {
        a.fields().len() == b.fields().len()
            && a.fields()
                .iter()
                .zip(b.fields().iter())
                .all(|(x, y)| x.name() == y.name() && x.data_type() == y.data_type())
    }

    /// `concatenate([slices]) -> slice | error` (spec §4.B). All inputs must
    /// share an identical schema; the result's length is the sum of inputs'.
    pub fn concatenate(slices: Vec<TableSlice>) -> Result<TableSlice> {
        if slices.is_empty() {
            return Err(PipelineError::new(
                ErrorKind::Runtime,
                "concatenate requires at least one slice",
            ));
        }
        let schema = slices[0].schema();
        for s in &slices[1..] {
            if !Self::same_shape(&schema, &s.schema()) {
                return Err(PipelineError::new(
                    ErrorKind::Runtime,
                    "schema_mismatch: cannot concatenate slices with different schemas",
                ));
            }
        }
        let offset = slices.iter().find_map(|s| s.offset);
        let import_time = slices.iter().map(|s| s.import_time).min().unwrap_or(0);
        let batches: Vec<RecordBatch> = slices.into_iter().map(|s| s.batch).collect();
        let batch = concat_batches(&schema, batches.iter())
            .map_err(|e| PipelineError::with_source(ErrorKind::Runtime, e.to_string(), e.into()))?;
        TableSlice::new(batch, import_time, offset)
    }

    /// `split(slice, n) -> (slice, slice)`: zero-copy sub-ranges; `n` is
    /// clamped to `[0, length]` (spec §4.B).
    pub fn split(&self, n: usize) -> (TableSlice, TableSlice) {
        let n = n.min(self.len());
        let left = self.batch.slice(0, n);
        let right = self.batch.slice(n, self.len() - n);
        (
            TableSlice {
                batch: left,
                import_time: self.import_time,
                offset: self.offset,
            },
            TableSlice {
                batch: right,
                import_time: self.import_time,
                offset: self.offset.map(|o| o + n as u64),
            },
        )
    }

    /// `select_columns(slice, paths) -> slice` (spec §4.B): `path` is a
    /// dot-separated field name with `.*` wildcard semantics on records.
    /// Retained columns follow original schema order; duplicate paths are
    /// deduplicated.
    pub fn select_columns(&self, paths: &[String]) -> Result<TableSlice> {
        let mut root = Selector::Map(BTreeMap::new());
        for p in paths {
            let segments: Vec<&str> = p.split('.').collect();
            insert_path(&mut root, &segments);
        }
        let schema = self.schema();
        let arrays: Vec<ArrayRef> = (0..schema.fields().len())
            .map(|i| self.batch.column(i).clone())
            .collect();
        let (fields, arrays) = project(schema.fields(), &arrays, &root);
        let new_schema = Arc::new(Schema::new(fields));
        let batch = RecordBatch::try_new(new_schema, arrays).map_err(|e| {
            PipelineError::with_source(ErrorKind::Runtime, e.to_string(), e.into())
        })?;
        Ok(TableSlice {
            batch,
            import_time: self.import_time,
            offset: self.offset,
        })
    }

    /// `flatten(slice, sep) -> (slice, renamed_fields)` (spec §4.B): nested
    /// records are hoisted to top-level fields joined by `sep`; on name
    /// collisions the later field is renamed to `<name><sep><N>` with the
    /// smallest `N >= 1` that makes it unique.
    pub fn flatten(&self, sep: &str) -> Result<(TableSlice, Vec<String>)> {
        let schema = self.schema();
        let arrays: Vec<ArrayRef> = (0..schema.fields().len())
            .map(|i| self.batch.column(i).clone())
            .collect();
        let mut flat = Vec::new();
        flatten_fields(schema.fields(), &arrays, "", sep, &mut flat);

        let mut seen: HashSet<String> = HashSet::new();
        let mut renamed_fields = Vec::new();
        let mut fields = Vec::with_capacity(flat.len());
        let mut columns = Vec::with_capacity(flat.len());
        for (name, arr) in flat {
            let final_name = if seen.contains(&name) {
                let mut n: u64 = 1;
                loop {
                    let candidate = format!("{name}{sep}{n}");
                    if !seen.contains(&candidate) {
                        renamed_fields.push(candidate.clone());
                        break candidate;
                    }
                    n += 1;
                }
            } else {
                name
            };
            seen.insert(final_name.clone());
            fields.push(ArrowField::new(&final_name, arr.data_type().clone(), true));
            columns.push(arr);
        }
        let new_schema = Arc::new(Schema::new(fields));
        let batch = RecordBatch::try_new(new_schema, columns).map_err(|e| {
            PipelineError::with_source(ErrorKind::Runtime, e.to_string(), e.into())
        })?;
        Ok((
            TableSlice {
                batch,
                import_time: self.import_time,
                offset: self.offset,
            },
            renamed_fields,
        ))
    }
}

fn flatten_fields(
    fields: &Fields,
    arrays: &[ArrayRef],
    prefix: &str,
    sep: &str,
    out: &mut Vec<(String, ArrayRef)>,
) {
    for (f, a) in fields.iter().zip(arrays.iter()) {
        let name = if prefix.is_empty() {
            f.name().clone()
        } else {
            format!("{prefix}{sep}{}", f.name())
        };
        match f.data_type() {
            DataType::Struct(child_fields) => {
                if let Some(struct_arr) = a.as_any().downcast_ref::<StructArray>() {
                    let child_arrays: Vec<ArrayRef> =
                        (0..child_fields.len()).map(|i| struct_arr.column(i).clone()).collect();
                    flatten_fields(child_fields, &child_arrays, &name, sep, out);
                } else {
                    out.push((name, a.clone()));
                }
            }
            _ => out.push((name, a.clone())),
        }
    }
}

/// A trie of selected field paths, used by `select_columns`.
enum Selector {
    /// Keep the whole subtree rooted here as-is.
    All,
    /// Keep only the named children, recursively selected.
    Map(BTreeMap<String, Selector>),
}

fn insert_path(root: &mut Selector, segments: &[&str]) {
    if segments.is_empty() {
        return;
    }
    if segments.len() == 1 && segments[0] == "*" {
        *root = Selector::All;
        return;
    }
    let Selector::Map(map) = root else {
        return; // already `All`; a more specific path adds nothing
    };
    let (head, rest) = segments.split_first().unwrap();
    if rest.is_empty() {
        map.entry((*head).to_string()).or_insert(Selector::All);
    } else {
        let entry = map
            .entry((*head).to_string())
            .or_insert_with(|| Selector::Map(BTreeMap::new()));
        insert_path(entry, rest);
    }
}

fn project(fields: &Fields, arrays: &[ArrayRef], selector: &Selector) -> (Vec<ArrowField>, Vec<ArrayRef>) {
    match selector {
        Selector::All => (
            fields.iter().map(|f| f.as_ref().clone()).collect(),
            arrays.to_vec(),
        ),
        Selector::Map(map) => {
            let mut out_fields = Vec::new();
            let mut out_arrays = Vec::new();
            for (f, a) in fields.iter().zip(arrays.iter()) {
                let Some(child_sel) = map.get(f.name()) else {
                    continue;
                };
                match child_sel {
                    Selector::All => {
                        out_fields.push(f.as_ref().clone());
                        out_arrays.push(a.clone());
                    }
                    Selector::Map(_) => {
                        let DataType::Struct(child_fields) = f.data_type() else {
                            continue; // can't select into a non-record field
                        };
                        let Some(struct_arr) = a.as_any().downcast_ref::<StructArray>() else {
                            continue;
                        };
                        let child_arrays: Vec<ArrayRef> = (0..child_fields.len())
                            .map(|i| struct_arr.column(i).clone())
                            .collect();
                        let (pf, pa) = project(child_fields, &child_arrays, child_sel);
                        if pf.is_empty() {
                            continue;
                        }
                        let new_fields = Fields::from(pf);
                        let nulls = struct_arr.nulls().cloned();
                        let new_struct = StructArray::new(new_fields.clone(), pa, nulls);
                        out_fields.push(ArrowField::new(
                            f.name(),
                            DataType::Struct(new_fields),
                            f.is_nullable(),
                        ));
                        out_arrays.push(Arc::new(new_struct) as ArrayRef);
                    }
                }
            }
            (out_fields, out_arrays)
        }
    }
}

/// Deduplicates dot-path selectors, preserving first occurrence.
pub fn dedup_paths(paths: &[String]) -> Vec<String> {
    let mut seen = HashMap::new();
    let mut out = Vec::new();
    for p in paths {
        if seen.insert(p.clone(), ()).is_none() {
            out.push(p.clone());
        }
    }
    out
}

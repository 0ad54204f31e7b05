//! Typed evaluator (spec §4.C): `eval(expr, slice, ctx) -> series`.
//!
//! Numeric semantics are grounded in the original engine's checked-math
//! policy: integer overflow and division by zero never abort evaluation,
//! they produce `null` plus a warning diagnostic pinned to the expression's
//! source location.

use std::sync::Arc;

use datafusion::arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Array, Float64Builder, Int64Array,
    Int64Builder, ListArray, StringArray, StructArray,
};
use datafusion::arrow::datatypes::{DataType, Field as ArrowField, Fields};

use flux_core::arrow_mapping::from_arrow_field;
use flux_core::diagnostics::Diagnostic;
use flux_core::error::{ErrorKind, PipelineError, Result};
use flux_core::value::{Type, TypeKind, Value};
use flux_core::{ControlPlane, TableSlice};

use crate::ast::{BinaryOp, Expr, ExprKind, FieldPath, UnaryOp};
use crate::series::Series;

/// Threaded through evaluation: the control plane used to emit warning
/// diagnostics when an operation falls back to null (spec §4.A, §4.C).
pub struct EvalContext<'a> {
    pub control: &'a ControlPlane,
}

impl<'a> EvalContext<'a> {
    pub fn new(control: &'a ControlPlane) -> Self {
        Self { control }
    }

    fn warn(&self, expr: &Expr, message: impl Into<String>) {
        let mut diag = Diagnostic::warning(message);
        if let Some(loc) = expr.location {
            diag = diag.primary(loc);
        }
        self.control.emit(diag);
    }
}

/// `eval(expr, slice, ctx) -> series` (spec §4.C). Evaluates `expr` against
/// every row of `slice`, producing one [`Series`] of the same length.
pub fn eval(expr: &Expr, slice: &TableSlice, ctx: &EvalContext) -> Result<Series> {
    let len = slice.len();
    match &expr.kind {
        ExprKind::Literal(value) => Ok(literal_series(value, len)),
        ExprKind::Field(path) => resolve_field(slice, path).ok_or_else(|| {
            PipelineError::new(ErrorKind::TypeMismatch, format!("unknown field `{}`", path.0.join(".")))
        }),
        ExprKind::Unary(op, operand) => eval_unary(*op, operand, slice, ctx, expr),
        ExprKind::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, slice, ctx, expr),
        ExprKind::Call(name, args) => eval_call(name, args, slice, ctx),
        ExprKind::Pipeline(steps) => {
            // Each step is evaluated in turn; the pipeline's value is its
            // last step (there must be at least one).
            let mut result = None;
            for step in steps {
                result = Some(eval(step, slice, ctx)?);
            }
            result.ok_or_else(|| PipelineError::runtime("empty pipeline sub-expression"))
        }
    }
}

fn null_series(len: usize) -> Series {
    Series::new(Type::null(), datafusion::arrow::array::new_null_array(&DataType::Null, len))
}

fn literal_series(value: &Value, len: usize) -> Series {
    let ty = value.inferred_type();
    let array: ArrayRef = match value {
        Value::Null => datafusion::arrow::array::new_null_array(&DataType::Null, len),
        Value::Bool(b) => Arc::new(BooleanArray::from(vec![*b; len])),
        Value::Int64(v) => Arc::new(Int64Array::from(vec![*v; len])),
        Value::UInt64(v) => Arc::new(datafusion::arrow::array::UInt64Array::from(vec![*v; len])),
        Value::Double(v) => Arc::new(Float64Array::from(vec![*v; len])),
        Value::Duration(v) => Arc::new(Int64Array::from(vec![*v; len])),
        Value::Time(v) => Arc::new(Int64Array::from(vec![*v; len])),
        Value::String(s) => Arc::new(StringArray::from(vec![s.as_str(); len])),
        Value::Blob(b) => {
            Arc::new(datafusion::arrow::array::BinaryArray::from(vec![b.as_slice(); len]))
        }
        // Composite literals (list/map/record/ip/subnet/enum) are rare as
        // scalar expression constants; building their replicated column
        // arrays is left for when the surface language actually needs them.
        _ => return Series::new(ty, datafusion::arrow::array::new_null_array(&DataType::Null, len)),
    };
    Series::new(ty, array)
}

/// Resolves a field path against a slice's schema. Explicit multi-segment
/// paths are walked exactly; a bare single-segment name that doesn't match a
/// top-level field is searched for at every nesting level, with ambiguous
/// matches broken by the longest-path-then-lexicographically-first rule
/// (spec §4.C).
fn resolve_field(slice: &TableSlice, path: &FieldPath) -> Option<Series> {
    let schema = slice.schema();
    let batch = slice.batch();
    let arrays: Vec<ArrayRef> = (0..schema.fields().len()).map(|i| batch.column(i).clone()).collect();

    if let Some((field, array)) = resolve_exact(schema.fields(), &arrays, &path.0) {
        return Some(Series::new(from_arrow_field(&field), array));
    }
    if path.0.len() == 1 {
        let target = &path.0[0];
        let mut candidates: Vec<(Vec<String>, ArrowField, ArrayRef)> = Vec::new();
        collect_matches(schema.fields(), &arrays, Vec::new(), target, &mut candidates);
        candidates.sort_by(|a, b| {
            b.0.len()
                .cmp(&a.0.len())
                .then_with(|| a.0.join(".").cmp(&b.0.join(".")))
        });
        if let Some((_, field, array)) = candidates.into_iter().next() {
            return Some(Series::new(from_arrow_field(&field), array));
        }
    }
    None
}

fn resolve_exact(fields: &Fields, arrays: &[ArrayRef], path: &[String]) -> Option<(ArrowField, ArrayRef)> {
    let (head, rest) = path.split_first()?;
    let idx = fields.iter().position(|f| f.name() == head)?;
    let field = fields[idx].as_ref().clone();
    let array = arrays[idx].clone();
    if rest.is_empty() {
        return Some((field, array));
    }
    let DataType::Struct(child_fields) = field.data_type() else {
        return None;
    };
    let struct_arr = array.as_any().downcast_ref::<StructArray>()?;
    let child_arrays: Vec<ArrayRef> = (0..child_fields.len()).map(|i| struct_arr.column(i).clone()).collect();
    resolve_exact(child_fields, &child_arrays, rest)
}

fn collect_matches(
    fields: &Fields,
    arrays: &[ArrayRef],
    prefix: Vec<String>,
    target: &str,
    out: &mut Vec<(Vec<String>, ArrowField, ArrayRef)>,
) {
    for (f, a) in fields.iter().zip(arrays.iter()) {
        let mut path = prefix.clone();
        path.push(f.name().clone());
        if f.name() == target {
            out.push((path.clone(), f.as_ref().clone(), a.clone()));
        }
        if let DataType::Struct(child_fields) = f.data_type() {
            if let Some(struct_arr) = a.as_any().downcast_ref::<StructArray>() {
                let child_arrays: Vec<ArrayRef> =
                    (0..child_fields.len()).map(|i| struct_arr.column(i).clone()).collect();
                collect_matches(child_fields, &child_arrays, path, target, out);
            }
        }
    }
}

fn eval_unary(op: UnaryOp, operand: &Expr, slice: &TableSlice, ctx: &EvalContext, node: &Expr) -> Result<Series> {
    let series = eval(operand, slice, ctx)?;
    match op {
        UnaryOp::Not => {
            let Some(arr) = series.array.as_any().downcast_ref::<BooleanArray>() else {
                ctx.warn(node, "`!` requires a bool operand");
                return Ok(null_series(series.len()));
            };
            let mut builder = BooleanBuilder::with_capacity(arr.len());
            for i in 0..arr.len() {
                if arr.is_null(i) {
                    builder.append_null();
                } else {
                    builder.append_value(!arr.value(i));
                }
            }
            Ok(Series::new(Type::bool(), Arc::new(builder.finish())))
        }
        UnaryOp::Neg => {
            if let Some(arr) = series.array.as_any().downcast_ref::<Int64Array>() {
                let mut out = Vec::with_capacity(arr.len());
                let mut overflowed = 0usize;
                let mut validity = Vec::with_capacity(arr.len());
                for i in 0..arr.len() {
                    if arr.is_null(i) {
                        out.push(0);
                        validity.push(false);
                        continue;
                    }
                    match arr.value(i).checked_neg() {
                        Some(v) => {
                            out.push(v);
                            validity.push(true);
                        }
                        None => {
                            out.push(0);
                            validity.push(false);
                            overflowed += 1;
                        }
                    }
                }
                if overflowed > 0 {
                    ctx.warn(node, format!("integer overflow negating {overflowed} value(s)"));
                }
                let arr = build_int64(&out, &validity);
                Ok(Series::new(Type::int64(), Arc::new(arr)))
            } else if let Some(arr) = series.array.as_any().downcast_ref::<Float64Array>() {
                let out: Vec<f64> = (0..arr.len()).map(|i| -arr.value(i)).collect();
                let validity: Vec<bool> = (0..arr.len()).map(|i| !arr.is_null(i)).collect();
                let arr = build_float64(&out, &validity);
                Ok(Series::new(Type::double(), Arc::new(arr)))
            } else {
                ctx.warn(node, "`-` requires a numeric operand");
                Ok(null_series(series.len()))
            }
        }
        UnaryOp::BitNot => {
            if let Some(arr) = series.array.as_any().downcast_ref::<Int64Array>() {
                let out: Vec<i64> = (0..arr.len()).map(|i| !arr.value(i)).collect();
                let validity: Vec<bool> = (0..arr.len()).map(|i| !arr.is_null(i)).collect();
                let arr = build_int64(&out, &validity);
                Ok(Series::new(Type::int64(), Arc::new(arr)))
            } else {
                ctx.warn(node, "`~` requires an int64 operand");
                Ok(null_series(series.len()))
            }
        }
    }
}

/// Builds a nullable `Int64Array` from parallel value/validity vectors,
/// since Arrow's `from(Vec<T>)` constructor assumes every row is valid.
fn build_int64(values: &[i64], validity: &[bool]) -> Int64Array {
    let mut builder = Int64Builder::with_capacity(values.len());
    for (v, valid) in values.iter().zip(validity.iter()) {
        if *valid {
            builder.append_value(*v);
        } else {
            builder.append_null();
        }
    }
    builder.finish()
}

fn build_float64(values: &[f64], validity: &[bool]) -> Float64Array {
    let mut builder = Float64Builder::with_capacity(values.len());
    for (v, valid) in values.iter().zip(validity.iter()) {
        if *valid {
            builder.append_value(*v);
        } else {
            builder.append_null();
        }
    }
    builder.finish()
}

fn eval_binary(
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    slice: &TableSlice,
    ctx: &EvalContext,
    node: &Expr,
) -> Result<Series> {
    let l = eval(lhs, slice, ctx)?;
    let r = eval(rhs, slice, ctx)?;
    let len = slice.len();

    if op.is_comparison() {
        return Ok(eval_comparison(op, &l, &r, len));
    }
    match op {
        BinaryOp::And | BinaryOp::Or => Ok(eval_logical(op, &l, &r, len)),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            eval_arithmetic(op, &l, &r, len, ctx, node)
        }
        BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => Ok(eval_bitwise(op, &l, &r, len)),
        BinaryOp::In => eval_in(&l, &r, len),
        BinaryOp::Match => eval_match(&l, &r, len, ctx, node),
        _ => unreachable!("comparisons handled above"),
    }
}

fn eval_arithmetic(
    op: BinaryOp,
    l: &Series,
    r: &Series,
    len: usize,
    ctx: &EvalContext,
    node: &Expr,
) -> Result<Series> {
    let both_int = l.ty.is_numeric() && r.ty.is_numeric() && matches!(l.ty.kind, TypeKind::Int64) && matches!(r.ty.kind, TypeKind::Int64);
    if both_int {
        let la = l.array.as_any().downcast_ref::<Int64Array>();
        let ra = r.array.as_any().downcast_ref::<Int64Array>();
        if let (Some(la), Some(ra)) = (la, ra) {
            let mut out = Vec::with_capacity(len);
            let mut validity = Vec::with_capacity(len);
            let mut bad = 0usize;
            for i in 0..len {
                if la.is_null(i) || ra.is_null(i) {
                    out.push(0);
                    validity.push(false);
                    continue;
                }
                let (x, y) = (la.value(i), ra.value(i));
                let result = match op {
                    BinaryOp::Add => x.checked_add(y),
                    BinaryOp::Sub => x.checked_sub(y),
                    BinaryOp::Mul => x.checked_mul(y),
                    BinaryOp::Div => {
                        if y == 0 {
                            None
                        } else {
                            x.checked_div(y)
                        }
                    }
                    BinaryOp::Mod => {
                        if y == 0 {
                            None
                        } else {
                            x.checked_rem(y)
                        }
                    }
                    _ => unreachable!(),
                };
                match result {
                    Some(v) => {
                        out.push(v);
                        validity.push(true);
                    }
                    None => {
                        out.push(0);
                        validity.push(false);
                        bad += 1;
                    }
                }
            }
            if bad > 0 {
                let reason = if matches!(op, BinaryOp::Div | BinaryOp::Mod) {
                    "division by zero"
                } else {
                    "integer overflow"
                };
                ctx.warn(node, format!("{reason} in {bad} row(s), replaced with null"));
            }
            let arr = build_int64(&out, &validity);
            return Ok(Series::new(Type::int64(), Arc::new(arr)));
        }
    }
    // Mixed or floating-point operands: promote to double.
    let (Some(la), Some(ra)) = (as_f64(l), as_f64(r)) else {
        ctx.warn(node, "arithmetic requires numeric operands");
        return Ok(null_series(len));
    };
    let mut out = Vec::with_capacity(len);
    let mut validity = Vec::with_capacity(len);
    let mut bad = 0usize;
    for i in 0..len {
        let (Some(x), Some(y)) = (la[i], ra[i]) else {
            out.push(0.0);
            validity.push(false);
            continue;
        };
        let v = match op {
            BinaryOp::Add => Some(x + y),
            BinaryOp::Sub => Some(x - y),
            BinaryOp::Mul => Some(x * y),
            BinaryOp::Div | BinaryOp::Mod => {
                if y == 0.0 {
                    None
                } else if op == BinaryOp::Div {
                    Some(x / y)
                } else {
                    Some(x % y)
                }
            }
            _ => unreachable!(),
        };
        match v {
            Some(v) if v.is_finite() => {
                out.push(v);
                validity.push(true);
            }
            _ => {
                out.push(0.0);
                validity.push(false);
                bad += 1;
            }
        }
    }
    if bad > 0 {
        ctx.warn(node, format!("division by zero or overflow in {bad} row(s), replaced with null"));
    }
    let arr = build_float64(&out, &validity);
    Ok(Series::new(Type::double(), Arc::new(arr)))
}

/// Reads a numeric array as `Option<f64>` per row (`None` for null rows).
/// Returns `None` altogether if the series isn't a numeric array.
fn as_f64(series: &Series) -> Option<Vec<Option<f64>>> {
    if let Some(arr) = series.array.as_any().downcast_ref::<Float64Array>() {
        return Some((0..arr.len()).map(|i| (!arr.is_null(i)).then(|| arr.value(i))).collect());
    }
    if let Some(arr) = series.array.as_any().downcast_ref::<Int64Array>() {
        return Some((0..arr.len()).map(|i| (!arr.is_null(i)).then(|| arr.value(i) as f64)).collect());
    }
    None
}

fn eval_bitwise(op: BinaryOp, l: &Series, r: &Series, len: usize) -> Series {
    let (Some(la), Some(ra)) = (
        l.array.as_any().downcast_ref::<Int64Array>(),
        r.array.as_any().downcast_ref::<Int64Array>(),
    ) else {
        return null_series(len);
    };
    let mut out = Vec::with_capacity(len);
    let mut validity = Vec::with_capacity(len);
    for i in 0..len {
        if la.is_null(i) || ra.is_null(i) {
            out.push(0);
            validity.push(false);
            continue;
        }
        let (x, y) = (la.value(i), ra.value(i));
        out.push(match op {
            BinaryOp::BitAnd => x & y,
            BinaryOp::BitOr => x | y,
            BinaryOp::BitXor => x ^ y,
            _ => unreachable!(),
        });
        validity.push(true);
    }
    let arr = build_int64(&out, &validity);
    Series::new(Type::int64(), Arc::new(arr))
}

/// Three-valued logic: `false AND null = false`, `true OR null = true`,
/// otherwise null propagates (standard SQL semantics, matching the "null
/// unless otherwise specified" rule in spec §4.A).
fn eval_logical(op: BinaryOp, l: &Series, r: &Series, len: usize) -> Series {
    let (Some(la), Some(ra)) = (
        l.array.as_any().downcast_ref::<BooleanArray>(),
        r.array.as_any().downcast_ref::<BooleanArray>(),
    ) else {
        return null_series(len);
    };
    let mut builder = BooleanBuilder::with_capacity(len);
    for i in 0..len {
        let lv = (!la.is_null(i)).then(|| la.value(i));
        let rv = (!ra.is_null(i)).then(|| ra.value(i));
        let result = match op {
            BinaryOp::And => match (lv, rv) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
            BinaryOp::Or => match (lv, rv) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
            _ => unreachable!(),
        };
        match result {
            Some(v) => builder.append_value(v),
            None => builder.append_null(),
        }
    }
    Series::new(Type::bool(), Arc::new(builder.finish()))
}

/// Comparisons; `null` compared with anything yields `null`, not `false`
/// (spec §4.C).
fn eval_comparison(op: BinaryOp, l: &Series, r: &Series, len: usize) -> Series {
    let mut builder = BooleanBuilder::with_capacity(len);
    for i in 0..len {
        let ordering = compare_row(l, r, i);
        let result = ordering.map(|ord| match op {
            BinaryOp::Eq => ord == std::cmp::Ordering::Equal,
            BinaryOp::Ne => ord != std::cmp::Ordering::Equal,
            BinaryOp::Lt => ord == std::cmp::Ordering::Less,
            BinaryOp::Le => ord != std::cmp::Ordering::Greater,
            BinaryOp::Gt => ord == std::cmp::Ordering::Greater,
            BinaryOp::Ge => ord != std::cmp::Ordering::Less,
            _ => unreachable!(),
        });
        match result {
            Some(v) => builder.append_value(v),
            None => builder.append_null(),
        }
    }
    Series::new(Type::bool(), Arc::new(builder.finish()))
}

fn compare_row(l: &Series, r: &Series, i: usize) -> Option<std::cmp::Ordering> {
    if l.array.is_null(i) || r.array.is_null(i) {
        return None;
    }
    if let (Some(la), Some(ra)) = (
        l.array.as_any().downcast_ref::<Int64Array>(),
        r.array.as_any().downcast_ref::<Int64Array>(),
    ) {
        return Some(la.value(i).cmp(&ra.value(i)));
    }
    if let (Some(la), Some(ra)) = (as_f64(l), as_f64(r)) {
        let (Some(x), Some(y)) = (la[i], ra[i]) else {
            return None;
        };
        return x.partial_cmp(&y);
    }
    if let (Some(la), Some(ra)) = (
        l.array.as_any().downcast_ref::<StringArray>(),
        r.array.as_any().downcast_ref::<StringArray>(),
    ) {
        return Some(la.value(i).cmp(ra.value(i)));
    }
    if let (Some(la), Some(ra)) = (
        l.array.as_any().downcast_ref::<BooleanArray>(),
        r.array.as_any().downcast_ref::<BooleanArray>(),
    ) {
        return Some(la.value(i).cmp(&ra.value(i)));
    }
    None
}

/// `in` on a list: structural equality of the left-hand value against each
/// element of the right-hand list column; `null in xs` is `null` (spec
/// §4.C).
fn eval_in(l: &Series, r: &Series, len: usize) -> Result<Series> {
    let Some(list) = r.array.as_any().downcast_ref::<ListArray>() else {
        return Err(PipelineError::new(ErrorKind::TypeMismatch, "`in` requires a list right-hand side"));
    };
    let mut builder = BooleanBuilder::with_capacity(len);
    for i in 0..len {
        if l.array.is_null(i) {
            builder.append_null();
            continue;
        }
        let values = list.value(i);
        let mut found = false;
        for j in 0..values.len() {
            if values.is_null(j) {
                continue;
            }
            if scalar_struct_equal(&l.array, i, &values, j) {
                found = true;
                break;
            }
        }
        builder.append_value(found);
    }
    Ok(Series::new(Type::bool(), Arc::new(builder.finish())))
}

fn scalar_struct_equal(a: &ArrayRef, i: usize, b: &ArrayRef, j: usize) -> bool {
    if let (Some(x), Some(y)) = (a.as_any().downcast_ref::<Int64Array>(), b.as_any().downcast_ref::<Int64Array>()) {
        return x.value(i) == y.value(j);
    }
    if let (Some(x), Some(y)) = (a.as_any().downcast_ref::<Float64Array>(), b.as_any().downcast_ref::<Float64Array>()) {
        return x.value(i) == y.value(j);
    }
    if let (Some(x), Some(y)) = (a.as_any().downcast_ref::<StringArray>(), b.as_any().downcast_ref::<StringArray>()) {
        return x.value(i) == y.value(j);
    }
    if let (Some(x), Some(y)) = (a.as_any().downcast_ref::<BooleanArray>(), b.as_any().downcast_ref::<BooleanArray>()) {
        return x.value(i) == y.value(j);
    }
    false
}

fn eval_match(l: &Series, r: &Series, len: usize, ctx: &EvalContext, node: &Expr) -> Result<Series> {
    let (Some(haystacks), Some(patterns)) = (
        l.array.as_any().downcast_ref::<StringArray>(),
        r.array.as_any().downcast_ref::<StringArray>(),
    ) else {
        ctx.warn(node, "`match` requires string operands");
        return Ok(null_series(len));
    };
    let mut builder = BooleanBuilder::with_capacity(len);
    let mut compiled: Option<(String, regex::Regex)> = None;
    for i in 0..len {
        if haystacks.is_null(i) || patterns.is_null(i) {
            builder.append_null();
            continue;
        }
        let pattern = patterns.value(i);
        if compiled.as_ref().map(|(p, _)| p != pattern).unwrap_or(true) {
            match regex::Regex::new(pattern) {
                Ok(re) => compiled = Some((pattern.to_string(), re)),
                Err(e) => {
                    ctx.warn(node, format!("invalid regex `{pattern}`: {e}"));
                    builder.append_null();
                    continue;
                }
            }
        }
        let re = &compiled.as_ref().unwrap().1;
        builder.append_value(re.is_match(haystacks.value(i)));
    }
    Ok(Series::new(Type::bool(), Arc::new(builder.finish())))
}

/// Built-in function calls. This is a small, deliberately open-ended set;
/// operators needing richer aggregation semantics (e.g. the `all`
/// aggregation function) implement them directly over `TableSlice` rather
/// than through this generic call path.
fn eval_call(name: &str, args: &[Expr], slice: &TableSlice, ctx: &EvalContext) -> Result<Series> {
    match name {
        "len" if args.len() == 1 => {
            let series = eval(&args[0], slice, ctx)?;
            if let Some(list) = series.array.as_any().downcast_ref::<ListArray>() {
                let values: Vec<i64> = (0..list.len())
                    .map(|i| if list.is_null(i) { 0 } else { list.value(i).len() as i64 })
                    .collect();
                let validity: Vec<bool> = (0..list.len()).map(|i| !list.is_null(i)).collect();
                let arr = build_int64(&values, &validity);
                Ok(Series::new(Type::int64(), Arc::new(arr)))
            } else if let Some(s) = series.array.as_any().downcast_ref::<StringArray>() {
                let values: Vec<i64> = (0..s.len())
                    .map(|i| if s.is_null(i) { 0 } else { s.value(i).len() as i64 })
                    .collect();
                let validity: Vec<bool> = (0..s.len()).map(|i| !s.is_null(i)).collect();
                let arr = build_int64(&values, &validity);
                Ok(Series::new(Type::int64(), Arc::new(arr)))
            } else {
                Err(PipelineError::new(ErrorKind::TypeMismatch, "len() requires a string or list operand"))
            }
        }
        other => Err(PipelineError::new(
            ErrorKind::TypeMismatch,
            format!("unknown function `{other}`"),
        )),
    }
}

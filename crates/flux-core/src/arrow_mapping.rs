//! Maps the logical [`Type`] model onto `datafusion::arrow`'s `DataType`,
//! per the table in SPEC_FULL.md §3.6. Domain-specific primitives (`ip`,
//! `subnet`, `enum`) are carried through Arrow's field metadata, the same
//! mechanism Arrow's own extension types use.

use std::sync::Arc;

use datafusion::arrow::datatypes::{DataType, Field as ArrowField, Fields, TimeUnit};

use crate::value::{EnumVariants, Type, TypeKind};

/// The metadata key used to tag a `DataType` with the logical type it
/// represents, for the handful of logical types that don't map to a unique
/// Arrow `DataType` on their own (`ip`, `subnet`, `enum`).
pub const FLUX_TYPE_KEY: &str = "flux.type";

/// Converts a logical [`Type`] into the Arrow [`ArrowField`] used to carry
/// columns of that type inside a [`crate::slice::TableSlice`]. `nullable` is
/// always `true`: null handling is uniform (spec §3.2), so the schema never
/// encodes non-nullability itself.
pub fn to_arrow_field(name: &str, ty: &Type) -> ArrowField {
    let data_type = to_arrow_data_type(ty);
    let mut metadata = std::collections::HashMap::new();
    for (k, v) in &ty.attributes {
        metadata.insert(k.clone(), v.clone());
    }
    if let Some(tag) = flux_type_tag(ty) {
        metadata.insert(FLUX_TYPE_KEY.to_string(), tag.to_string());
    }
    ArrowField::new(name, data_type, true).with_metadata(metadata)
}

fn flux_type_tag(ty: &Type) -> Option<&'static str> {
    match &ty.kind {
        TypeKind::Ip => Some("ip"),
        TypeKind::Subnet => Some("subnet"),
        TypeKind::Enum(_) => Some("enum"),
        _ => None,
    }
}

pub fn to_arrow_data_type(ty: &Type) -> DataType {
    match &ty.kind {
        TypeKind::Null => DataType::Null,
        TypeKind::Bool => DataType::Boolean,
        TypeKind::Int64 => DataType::Int64,
        TypeKind::UInt64 => DataType::UInt64,
        TypeKind::Double => DataType::Float64,
        TypeKind::Duration => DataType::Duration(TimeUnit::Nanosecond),
        TypeKind::Time => DataType::Timestamp(TimeUnit::Nanosecond, None),
        TypeKind::String => DataType::Utf8,
        TypeKind::Blob => DataType::Binary,
        TypeKind::Ip => DataType::FixedSizeBinary(16),
        TypeKind::Subnet => DataType::Struct(Fields::from(vec![
            ArrowField::new("address", DataType::FixedSizeBinary(16), false),
            ArrowField::new("length", DataType::UInt8, false),
        ])),
        TypeKind::Enum(_) => {
            DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8))
        }
        TypeKind::List(elem) => {
            DataType::List(Arc::new(to_arrow_field("item", elem)))
        }
        TypeKind::Map(key, value) => {
            let entries = ArrowField::new(
                "entries",
                DataType::Struct(Fields::from(vec![
                    to_arrow_field("key", key),
                    to_arrow_field("value", value),
                ])),
                false,
            );
            DataType::Map(Arc::new(entries), false)
        }
        TypeKind::Record(fields) => {
            let arrow_fields: Vec<ArrowField> = fields
                .iter()
                .map(|f| to_arrow_field(&f.name, &f.ty))
                .collect();
            DataType::Struct(Fields::from(arrow_fields))
        }
    }
}

/// Reconstructs a logical [`Type`] from an Arrow field, inverting
/// [`to_arrow_field`]. Used when a slice arrives over the wire (spec §6.3)
/// and only its Arrow schema is available.
pub fn from_arrow_field(field: &ArrowField) -> Type {
    let flux_tag = field.metadata().get(FLUX_TYPE_KEY).map(|s| s.as_str());
    let mut ty = match (flux_tag, field.data_type()) {
        (Some("ip"), _) => Type::ip(),
        (Some("subnet"), _) => Type::subnet(),
        (Some("enum"), DataType::Dictionary(_, _)) => {
            // Variant names are not recoverable from the Arrow schema alone
            // without the accompanying dictionary values; callers that need
            // them should consult the dictionary array directly.
            Type::new(TypeKind::Enum(EnumVariants(Vec::new())))
        }
        (_, DataType::Null) => Type::null(),
        (_, DataType::Boolean) => Type::bool(),
        (_, DataType::Int64) => Type::int64(),
        (_, DataType::UInt64) => Type::uint64(),
        (_, DataType::Float64) => Type::double(),
        (_, DataType::Duration(_)) => Type::duration(),
        (_, DataType::Timestamp(_, _)) => Type::time(),
        (_, DataType::Utf8) => Type::string(),
        (_, DataType::Binary) | (_, DataType::FixedSizeBinary(_)) => Type::blob(),
        (_, DataType::List(inner)) => Type::list(from_arrow_field(inner)),
        (_, DataType::Map(entries, _)) => {
            if let DataType::Struct(kv) = entries.data_type() {
                let key = from_arrow_field(&kv[0]);
                let value = from_arrow_field(&kv[1]);
                Type::map(key, value)
            } else {
                Type::map(Type::null(), Type::null())
            }
        }
        (_, DataType::Struct(fields)) => {
            let fs: Vec<_> = fields
                .iter()
                .map(|f| crate::value::Field::new(f.name().clone(), from_arrow_field(f)))
                .collect();
            Type::record(fs).unwrap_or_else(|| Type::new(TypeKind::Record(Arc::new(Vec::new()))))
        }
        _ => Type::string(),
    };
    for (k, v) in field.metadata() {
        if k != FLUX_TYPE_KEY {
            ty.attributes.insert(k.clone(), v.clone());
        }
    }
    ty
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Field;

    #[test]
    fn primitive_roundtrip() {
        for ty in [
            Type::null(),
            Type::bool(),
            Type::int64(),
            Type::uint64(),
            Type::double(),
            Type::duration(),
            Type::time(),
            Type::string(),
            Type::blob(),
        ] {
            let field = to_arrow_field("x", &ty);
            let back = from_arrow_field(&field);
            assert_eq!(ty.tag(), back.tag(), "roundtrip mismatch for {}", ty.tag());
        }
    }

    #[test]
    fn ip_and_subnet_roundtrip_via_metadata() {
        let field = to_arrow_field("addr", &Type::ip());
        assert_eq!(field.metadata().get(FLUX_TYPE_KEY).map(|s| s.as_str()), Some("ip"));
        assert_eq!(from_arrow_field(&field).tag(), "ip");

        let field = to_arrow_field("net", &Type::subnet());
        assert_eq!(from_arrow_field(&field).tag(), "subnet");
    }

    #[test]
    fn record_roundtrip_preserves_field_order() {
        let rec = Type::record(vec![
            Field::new("a", Type::int64()),
            Field::new("b", Type::string()),
        ])
        .unwrap();
        let field = to_arrow_field("r", &rec);
        let back = from_arrow_field(&field);
        let back_fields = back.as_record_fields().unwrap();
        assert_eq!(back_fields[0].name, "a");
        assert_eq!(back_fields[1].name, "b");
    }

    #[test]
    fn attributes_carried_through_metadata() {
        let ty = Type::string().with_attribute("hidden", "true");
        let field = to_arrow_field("s", &ty);
        let back = from_arrow_field(&field);
        assert_eq!(back.attribute("hidden"), Some("true"));
    }
}

//! Value & Type Model (spec §3.1, §4.A).
//!
//! [`Type`] is the tagged sum of logical types the pipeline core understands;
//! [`Value`] is its dynamic, in-memory counterpart used for scalar
//! construction and inspection (`pack`/`unpack`). Bulk columnar data lives in
//! [`crate::slice::TableSlice`] as Arrow arrays, not as `Vec<Value>` — `Value`
//! exists for the places the spec calls for single-value semantics: literals,
//! aggregation results, expression constants.

use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// String-keyed attributes attached to a [`Type`] (spec §3.1). Lookup is
/// O(attributes), matching the spec's explicit complexity note.
pub type Attributes = BTreeMap<String, String>;

/// An IPv6-mapped address; IPv4 addresses are represented in IPv4-mapped
/// IPv6 form, per spec §3.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ip(pub Ipv6Addr);

impl Ip {
    pub fn v4(a: std::net::Ipv4Addr) -> Self {
        Ip(a.to_ipv6_mapped())
    }

    pub fn v6(a: Ipv6Addr) -> Self {
        Ip(a)
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0.octets()
    }
}

/// An `ip`/prefix-length pair; `length` is validated to be `<= 128` by every
/// constructor (spec §3.1 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subnet {
    pub address: Ip,
    pub length: u8,
}

impl Subnet {
    pub fn new(address: Ip, length: u8) -> Option<Self> {
        if length > 128 {
            return None;
        }
        Some(Self { address, length })
    }
}

/// A named integer variant set (spec §3.1 `enum`). Variants are ordered;
/// their position is the value's discriminant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumVariants(pub Vec<String>);

impl EnumVariants {
    pub fn index_of(&self, name: &str) -> Option<i64> {
        self.0.iter().position(|v| v == name).map(|i| i as i64)
    }

    pub fn name_of(&self, index: i64) -> Option<&str> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.0.get(i))
            .map(|s| s.as_str())
    }
}

/// A uniquely-named, ordered field of a [`Type::Record`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: Type,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self { name: name.into(), ty }
    }
}

/// The tagged sum of logical types (spec §3.1). Types are structurally
/// hashed and compared: two types are equal iff their shape and attributes
/// coincide (see [`Type::equal`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeKind {
    Null,
    Bool,
    Int64,
    UInt64,
    Double,
    Duration,
    Time,
    String,
    Blob,
    Ip,
    Subnet,
    Enum(EnumVariants),
    List(Box<Type>),
    Map(Box<Type>, Box<Type>),
    Record(Arc<Vec<Field>>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Type {
    pub kind: TypeKind,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Type {
    pub fn new(kind: TypeKind) -> Self {
        Self {
            kind,
            attributes: Attributes::new(),
        }
    }

    pub fn null() -> Self {
        Self::new(TypeKind::Null)
    }
    pub fn bool() -> Self {
        Self::new(TypeKind::Bool)
    }
    pub fn int64() -> Self {
        Self::new(TypeKind::Int64)
    }
    pub fn uint64() -> Self {
        Self::new(TypeKind::UInt64)
    }
    pub fn double() -> Self {
        Self::new(TypeKind::Double)
    }
    pub fn duration() -> Self {
        Self::new(TypeKind::Duration)
    }
    pub fn time() -> Self {
        Self::new(TypeKind::Time)
    }
    pub fn string() -> Self {
        Self::new(TypeKind::String)
    }
    pub fn blob() -> Self {
        Self::new(TypeKind::Blob)
    }
    pub fn ip() -> Self {
        Self::new(TypeKind::Ip)
    }
    pub fn subnet() -> Self {
        Self::new(TypeKind::Subnet)
    }
    pub fn list(element: Type) -> Self {
        Self::new(TypeKind::List(Box::new(element)))
    }
    pub fn map(key: Type, value: Type) -> Self {
        Self::new(TypeKind::Map(Box::new(key), Box::new(value)))
    }

    /// Builds a record type, validating that field names are unique (spec
    /// §3.1 invariant). Returns `None` on a duplicate name.
    pub fn record(fields: Vec<Field>) -> Option<Self> {
        let mut seen = std::collections::HashSet::new();
        for f in &fields {
            if !seen.insert(f.name.as_str()) {
                return None;
            }
        }
        Some(Self::new(TypeKind::Record(Arc::new(fields))))
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// `attribute(name)` lookup, O(attributes) per spec §4.A.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|s| s.as_str())
    }

    /// `kind(type) -> tag`, the closed set discriminant (spec §4.A).
    pub fn tag(&self) -> &'static str {
        match &self.kind {
            TypeKind::Null => "null",
            TypeKind::Bool => "bool",
            TypeKind::Int64 => "int64",
            TypeKind::UInt64 => "uint64",
            TypeKind::Double => "double",
            TypeKind::Duration => "duration",
            TypeKind::Time => "time",
            TypeKind::String => "string",
            TypeKind::Blob => "blob",
            TypeKind::Ip => "ip",
            TypeKind::Subnet => "subnet",
            TypeKind::Enum(_) => "enum",
            TypeKind::List(_) => "list",
            TypeKind::Map(_, _) => "map",
            TypeKind::Record(_) => "record",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Int64 | TypeKind::UInt64 | TypeKind::Double
        )
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self.kind, TypeKind::Duration | TypeKind::Time)
    }

    pub fn as_record_fields(&self) -> Option<&[Field]> {
        match &self.kind {
            TypeKind::Record(fields) => Some(fields.as_slice()),
            _ => None,
        }
    }

    /// Structural equality: shape and attributes must coincide (spec §3.1).
    pub fn equal(&self, other: &Type) -> bool {
        self == other
    }

    /// `subsumes(nominal, actual)`: is `actual` assignable to `nominal`
    /// (spec §4.A)? Identical types always subsume; `null` is assignable to
    /// (and accepts) any type; enum variants are compatible if their
    /// numeric range lines up, i.e. `actual`'s variant set is a prefix-free
    /// subset occupying the same indices as far as it goes.
    pub fn subsumes(nominal: &Type, actual: &Type) -> bool {
        if nominal == actual {
            return true;
        }
        match (&nominal.kind, &actual.kind) {
            (_, TypeKind::Null) | (TypeKind::Null, _) => true,
            (TypeKind::Enum(n), TypeKind::Enum(a)) => {
                a.0.iter().zip(n.0.iter()).all(|(x, y)| x == y)
            }
            (TypeKind::List(n), TypeKind::List(a)) => Type::subsumes(n, a),
            (TypeKind::Map(nk, nv), TypeKind::Map(ak, av)) => {
                Type::subsumes(nk, ak) && Type::subsumes(nv, av)
            }
            (TypeKind::Record(n), TypeKind::Record(a)) => {
                n.len() == a.len()
                    && n.iter()
                        .zip(a.iter())
                        .all(|(nf, af)| nf.name == af.name && Type::subsumes(&nf.ty, &af.ty))
            }
            _ => false,
        }
    }
}

/// The dynamic counterpart of [`Type`]: a single packed/unpacked value (spec
/// §4.A `pack`/`unpack`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    /// Signed nanoseconds.
    Duration(i64),
    /// Nanoseconds since the Unix epoch.
    Time(i64),
    String(String),
    Blob(Vec<u8>),
    Ip(Ip),
    Subnet(Subnet),
    Enum(i64),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Record(Vec<(String, Value)>),
}

impl Value {
    /// `pack`: construct a dynamic value with a known type, checking it
    /// against the expected [`TypeKind`] shape. Returns `None` on mismatch.
    pub fn pack(ty: &Type, value: Value) -> Option<Value> {
        let matches = match (&ty.kind, &value) {
            (TypeKind::Null, Value::Null) => true,
            (TypeKind::Bool, Value::Bool(_)) => true,
            (TypeKind::Int64, Value::Int64(_)) => true,
            (TypeKind::UInt64, Value::UInt64(_)) => true,
            (TypeKind::Double, Value::Double(_)) => true,
            (TypeKind::Duration, Value::Duration(_)) => true,
            (TypeKind::Time, Value::Time(_)) => true,
            (TypeKind::String, Value::String(_)) => true,
            (TypeKind::Blob, Value::Blob(_)) => true,
            (TypeKind::Ip, Value::Ip(_)) => true,
            (TypeKind::Subnet, Value::Subnet(_)) => true,
            (TypeKind::Enum(_), Value::Enum(_)) => true,
            (TypeKind::List(_), Value::List(_)) => true,
            (TypeKind::Map(_, _), Value::Map(_)) => true,
            (TypeKind::Record(_), Value::Record(_)) => true,
            (_, Value::Null) => true,
            _ => false,
        };
        matches.then_some(value)
    }

    /// `unpack`: inspect a dynamic value's tag without consuming it.
    pub fn tag(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Double(_) => "double",
            Value::Duration(_) => "duration",
            Value::Time(_) => "time",
            Value::String(_) => "string",
            Value::Blob(_) => "blob",
            Value::Ip(_) => "ip",
            Value::Subnet(_) => "subnet",
            Value::Enum(_) => "enum",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Record(_) => "record",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Infers the narrowest [`Type`] a bare value is consistent with. Used
    /// when a literal appears without an explicit declared type (e.g. an
    /// expression literal). `Enum` values carry no variant names at this
    /// level, so the inferred type has an empty variant list.
    pub fn inferred_type(&self) -> Type {
        match self {
            Value::Null => Type::null(),
            Value::Bool(_) => Type::bool(),
            Value::Int64(_) => Type::int64(),
            Value::UInt64(_) => Type::uint64(),
            Value::Double(_) => Type::double(),
            Value::Duration(_) => Type::duration(),
            Value::Time(_) => Type::time(),
            Value::String(_) => Type::string(),
            Value::Blob(_) => Type::blob(),
            Value::Ip(_) => Type::ip(),
            Value::Subnet(_) => Type::subnet(),
            Value::Enum(_) => Type::new(TypeKind::Enum(EnumVariants(Vec::new()))),
            Value::List(items) => {
                Type::list(items.first().map(Value::inferred_type).unwrap_or_else(Type::null))
            }
            Value::Map(entries) => {
                let (k, v) = entries
                    .first()
                    .map(|(k, v)| (k.inferred_type(), v.inferred_type()))
                    .unwrap_or_else(|| (Type::null(), Type::null()));
                Type::map(k, v)
            }
            Value::Record(fields) => Type::record(
                fields
                    .iter()
                    .map(|(name, v)| Field::new(name.clone(), v.inferred_type()))
                    .collect(),
            )
            .unwrap_or_else(|| Type::new(TypeKind::Record(Arc::new(Vec::new())))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_rejects_duplicate_field_names() {
        let fields = vec![
            Field::new("a", Type::int64()),
            Field::new("a", Type::string()),
        ];
        assert!(Type::record(fields).is_none());
    }

    #[test]
    fn subnet_rejects_prefix_over_128() {
        assert!(Subnet::new(Ip::v4([1, 2, 3, 4].into()), 129).is_none());
        assert!(Subnet::new(Ip::v4([1, 2, 3, 4].into()), 128).is_some());
    }

    #[test]
    fn subsumes_null_both_ways() {
        assert!(Type::subsumes(&Type::int64(), &Type::null()));
        assert!(Type::subsumes(&Type::null(), &Type::int64()));
    }

    #[test]
    fn subsumes_identical_and_structural_record() {
        let a = Type::record(vec![Field::new("x", Type::int64())]).unwrap();
        let b = Type::record(vec![Field::new("x", Type::int64())]).unwrap();
        assert!(Type::subsumes(&a, &b));
        let c = Type::record(vec![Field::new("x", Type::string())]).unwrap();
        assert!(!Type::subsumes(&a, &c));
    }

    #[test]
    fn attribute_lookup() {
        let t = Type::string().with_attribute("hidden", "true");
        assert_eq!(t.attribute("hidden"), Some("true"));
        assert_eq!(t.attribute("missing"), None);
    }

    #[test]
    fn pack_rejects_tag_mismatch_but_allows_null() {
        assert!(Value::pack(&Type::int64(), Value::Int64(3)).is_some());
        assert!(Value::pack(&Type::int64(), Value::String("x".into())).is_none());
        assert!(Value::pack(&Type::int64(), Value::Null).is_some());
    }

    #[test]
    fn types_with_same_shape_but_different_attributes_are_unequal() {
        let a = Type::string();
        let b = Type::string().with_attribute("hidden", "true");
        assert!(!a.equal(&b));
    }
}

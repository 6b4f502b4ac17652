//! # Packet Shapes
//!
//! Declarative field-shape descriptors attached to every packet type.
//!
//! A [`Schema`] lists the fields of a packet in wire order together with their
//! primitive kind. The payload codec walks the schema instead of reflecting over the
//! Rust type, and the [`TypeDescriptor`] (name + schema) is what travels to the peer
//! when a type is announced at runtime.
//!
//! ## Example
//! ```rust
//! use packet_link::core::schema::{FieldKind, Packet, Schema};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct CalculationRequest {
//!     x: i32,
//!     y: i32,
//! }
//!
//! impl Packet for CalculationRequest {
//!     const NAME: &'static str = "demo.CalculationRequest";
//!
//!     fn schema() -> Schema {
//!         Schema::new().field("x", FieldKind::I32).field("y", FieldKind::I32)
//!     }
//! }
//! ```

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Maximum nesting depth accepted in a descriptor received from a peer.
pub const MAX_SCHEMA_DEPTH: usize = 32;

/// Primitive, nested-object or sequence kind of a single field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    U8,
    U16,
    U32,
    U64,
    I32,
    I64,
    F32,
    F64,
    String,
    Bytes,
    Sequence(Box<FieldKind>),
    Optional(Box<FieldKind>),
    Object(Schema),
}

impl FieldKind {
    pub fn sequence(inner: FieldKind) -> Self {
        FieldKind::Sequence(Box::new(inner))
    }

    pub fn optional(inner: FieldKind) -> Self {
        FieldKind::Optional(Box::new(inner))
    }

    fn depth(&self) -> usize {
        match self {
            FieldKind::Sequence(inner) | FieldKind::Optional(inner) => 1 + inner.depth(),
            FieldKind::Object(schema) => 1 + schema.depth(),
            _ => 0,
        }
    }
}

/// A named field within a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
}

/// Ordered field list of a packet or nested object.
///
/// On the wire a schema is a flat pre-order list of [`ShapeToken`]s, so decoding a
/// peer's descriptor never recurses deeper than [`MAX_SCHEMA_DEPTH`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Append a field (builder style)
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(Field {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Deepest nesting level of sequences, optionals and objects.
    pub fn depth(&self) -> usize {
        self.fields.iter().map(|f| f.kind.depth()).max().unwrap_or(0)
    }

    /// Check a peer-supplied schema for shapes this side refuses to decode.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.depth() > MAX_SCHEMA_DEPTH {
            return Err(format!("schema nests deeper than {MAX_SCHEMA_DEPTH} levels"));
        }
        let mut seen = std::collections::HashSet::new();
        for field in &self.fields {
            if field.name.is_empty() {
                return Err("schema contains an unnamed field".to_string());
            }
            if !seen.insert(field.name.as_str()) {
                return Err(format!("duplicate field '{}'", field.name));
            }
            if let FieldKind::Object(inner) = &field.kind {
                inner.validate()?;
            }
        }
        Ok(())
    }
}

/// One step of a flattened schema.
///
/// A schema is `Object(n)` followed by `n` fields; a field is `Name` followed by its
/// kind; `Sequence` and `Optional` are followed by their element kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum ShapeToken {
    Bool,
    U8,
    U16,
    U32,
    U64,
    I32,
    I64,
    F32,
    F64,
    String,
    Bytes,
    Sequence,
    Optional,
    Object(u32),
    Name(String),
}

impl Schema {
    pub(crate) fn to_tokens(&self) -> Vec<ShapeToken> {
        let mut tokens = Vec::new();
        push_object(self, &mut tokens);
        tokens
    }

    /// Rebuild a schema, refusing anything nested deeper than [`MAX_SCHEMA_DEPTH`].
    pub(crate) fn from_tokens(tokens: &[ShapeToken]) -> std::result::Result<Self, String> {
        let mut reader = ShapeReader {
            tokens: tokens.iter(),
        };
        let schema = match reader.next()? {
            ShapeToken::Object(count) => reader.fields(*count, 0)?,
            other => return Err(format!("schema must start with an object, found {other:?}")),
        };
        if reader.tokens.next().is_some() {
            return Err("trailing tokens after schema".to_string());
        }
        Ok(schema)
    }
}

fn push_object(schema: &Schema, tokens: &mut Vec<ShapeToken>) {
    tokens.push(ShapeToken::Object(schema.fields.len() as u32));
    for field in &schema.fields {
        tokens.push(ShapeToken::Name(field.name.clone()));
        push_kind(&field.kind, tokens);
    }
}

fn push_kind(kind: &FieldKind, tokens: &mut Vec<ShapeToken>) {
    let token = match kind {
        FieldKind::Bool => ShapeToken::Bool,
        FieldKind::U8 => ShapeToken::U8,
        FieldKind::U16 => ShapeToken::U16,
        FieldKind::U32 => ShapeToken::U32,
        FieldKind::U64 => ShapeToken::U64,
        FieldKind::I32 => ShapeToken::I32,
        FieldKind::I64 => ShapeToken::I64,
        FieldKind::F32 => ShapeToken::F32,
        FieldKind::F64 => ShapeToken::F64,
        FieldKind::String => ShapeToken::String,
        FieldKind::Bytes => ShapeToken::Bytes,
        FieldKind::Sequence(inner) => {
            tokens.push(ShapeToken::Sequence);
            return push_kind(inner, tokens);
        }
        FieldKind::Optional(inner) => {
            tokens.push(ShapeToken::Optional);
            return push_kind(inner, tokens);
        }
        FieldKind::Object(schema) => return push_object(schema, tokens),
    };
    tokens.push(token);
}

struct ShapeReader<'a> {
    tokens: std::slice::Iter<'a, ShapeToken>,
}

impl<'a> ShapeReader<'a> {
    fn next(&mut self) -> std::result::Result<&'a ShapeToken, String> {
        self.tokens
            .next()
            .ok_or_else(|| "schema ends early".to_string())
    }

    fn fields(&mut self, count: u32, depth: usize) -> std::result::Result<Schema, String> {
        // count is peer-supplied: grow as fields actually arrive
        let mut schema = Schema::new();
        for _ in 0..count {
            let name = match self.next()? {
                ShapeToken::Name(name) => name.clone(),
                other => return Err(format!("expected a field name, found {other:?}")),
            };
            let kind = self.kind(depth)?;
            schema.fields.push(Field { name, kind });
        }
        Ok(schema)
    }

    /// `depth` counts the sequences, optionals and objects enclosing this kind.
    fn kind(&mut self, depth: usize) -> std::result::Result<FieldKind, String> {
        let token = self.next()?;
        let nested = depth + 1;
        if matches!(
            token,
            ShapeToken::Sequence | ShapeToken::Optional | ShapeToken::Object(_)
        ) && nested > MAX_SCHEMA_DEPTH
        {
            return Err(format!("schema nests deeper than {MAX_SCHEMA_DEPTH} levels"));
        }
        Ok(match token {
            ShapeToken::Bool => FieldKind::Bool,
            ShapeToken::U8 => FieldKind::U8,
            ShapeToken::U16 => FieldKind::U16,
            ShapeToken::U32 => FieldKind::U32,
            ShapeToken::U64 => FieldKind::U64,
            ShapeToken::I32 => FieldKind::I32,
            ShapeToken::I64 => FieldKind::I64,
            ShapeToken::F32 => FieldKind::F32,
            ShapeToken::F64 => FieldKind::F64,
            ShapeToken::String => FieldKind::String,
            ShapeToken::Bytes => FieldKind::Bytes,
            ShapeToken::Sequence => FieldKind::sequence(self.kind(nested)?),
            ShapeToken::Optional => FieldKind::optional(self.kind(nested)?),
            ShapeToken::Object(count) => FieldKind::Object(self.fields(*count, nested)?),
            ShapeToken::Name(name) => return Err(format!("unexpected field name '{name}'")),
        })
    }
}

impl Serialize for Schema {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_tokens().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Schema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let tokens = Vec::<ShapeToken>::deserialize(deserializer)?;
        Schema::from_tokens(&tokens).map_err(de::Error::custom)
    }
}

/// Wire-transmissible description of a packet type: stable name plus shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,
    pub schema: Schema,
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.is_empty() {
            return Err("type descriptor has no name".to_string());
        }
        self.schema.validate()
    }
}

/// An application packet type.
///
/// `NAME` must be identical on both peers; numeric ids are negotiated per connection.
pub trait Packet: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;

    fn schema() -> Schema;

    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::new(Self::NAME, Self::schema())
    }
}

//! # Core Protocol Components
//!
//! Low-level frame handling, codecs, and the schema-driven payload encoding.
//!
//! ## Components
//! - **Frame**: length-prefixed, type-tagged wire unit with transform flags
//! - **Codec**: Tokio codec for framing over byte streams
//! - **Envelope**: role and correlation header inside each payload
//! - **Schema**: declarative packet shapes and the [`Packet`](schema::Packet) trait
//! - **Payload**: binary encoding of packet bodies driven by a schema
//!
//! ## Wire Format
//! ```text
//! [Length(4)] [TypeId(2)] [Flags(1)] [Payload(Length)] [Signature(64)?]
//! Payload = [Role(1)] [CorrelationId(8)] [Body(N)]   (before compression/encryption)
//! ```
//!
//! ## Security
//! - Maximum payload size: 16MB by default (prevents memory exhaustion)
//! - Length validation before allocation

pub mod codec;
pub mod envelope;
pub mod frame;
pub mod payload;
pub mod schema;

//! Handler table keyed by packet type name.
//!
//! Compile-time packet names are stored as `Cow::Borrowed`, so routing a known type
//! never allocates. Handlers are stored behind `Arc` and invoked after the read lock
//! is released.

use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::core::payload::encode_packet;
use crate::core::schema::Packet;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::connection::Connection;
use crate::protocol::registry::TypeRegistry;

/// A response produced by a request handler, already encoded against its schema.
#[derive(Debug, Clone)]
pub struct OutgoingPacket {
    pub type_id: u16,
    pub body: Vec<u8>,
}

type PlainFn = dyn Fn(Value, &Connection) -> Result<()> + Send + Sync + 'static;
type RequestFn = dyn Fn(Value, &Connection) -> Result<OutgoingPacket> + Send + Sync + 'static;

pub enum Handler {
    Plain(Box<PlainFn>),
    Request(Box<RequestFn>),
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<Cow<'static, str>, Arc<Handler>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.handlers.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("Dispatcher").field("handlers", &count).finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, name: &'static str, handler: Handler) -> Result<()> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string()))?;
        handlers.insert(Cow::Borrowed(name), Arc::new(handler));
        Ok(())
    }

    /// Handle plain packets of type `T`. Registers `T` locally so peers may announce it.
    pub fn on<T, F>(&self, registry: &TypeRegistry, handler: F) -> Result<()>
    where
        T: Packet,
        F: Fn(T, &Connection) + Send + Sync + 'static,
    {
        registry.register::<T>()?;
        self.insert(
            T::NAME,
            Handler::Plain(Box::new(move |value, conn| {
                let packet: T = serde_json::from_value(value)?;
                handler(packet, conn);
                Ok(())
            })),
        )
    }

    /// Answer requests of type `Req` with a `Resp`.
    pub fn on_request<Req, Resp, F>(&self, registry: &TypeRegistry, handler: F) -> Result<()>
    where
        Req: Packet,
        Resp: Packet,
        F: Fn(Req, &Connection) -> Result<Resp> + Send + Sync + 'static,
    {
        registry.register::<Req>()?;
        let response_id = registry.register::<Resp>()?;
        self.insert(
            Req::NAME,
            Handler::Request(Box::new(move |value, conn| {
                let request: Req = serde_json::from_value(value)?;
                let response = handler(request, conn)?;
                Ok(OutgoingPacket {
                    type_id: response_id,
                    body: encode_packet(&response)?,
                })
            })),
        )
    }

    pub fn get(&self, name: &str) -> Result<Option<Arc<Handler>>> {
        let handlers = self
            .handlers
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.to_string()))?;
        Ok(handlers.get(name).cloned())
    }

    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string()))?;
        Ok(handlers.remove(name).is_some())
    }
}

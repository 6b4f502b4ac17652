//! # Type Registry
//!
//! Maps numeric type ids to packet shapes.
//!
//! Each container owns one [`TypeRegistry`] holding its *local* ids. Ids are never
//! assumed to match across processes: before the first packet of a type crosses a
//! connection, the sender announces `(local id, descriptor)` and the receiver records
//! that mapping in the connection's [`PeerTypes`]. From then on frames from that peer
//! carrying the id decode with the agreed shape.
//!
//! A receiver accepts an announcement only when it knows a type of the same name with
//! an identical schema. Shape mismatches are refused rather than coerced.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::core::schema::{Packet, TypeDescriptor};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::type_ids::FIRST_APPLICATION;

/// A registered packet type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeEntry {
    pub id: u16,
    pub descriptor: TypeDescriptor,
}

impl TypeEntry {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

#[derive(Debug)]
struct Tables {
    by_name: HashMap<Cow<'static, str>, Arc<TypeEntry>>,
    by_id: HashMap<u16, Arc<TypeEntry>>,
    next_id: u32,
}

/// Local name/id table shared by every connection of a container.
#[derive(Debug)]
pub struct TypeRegistry {
    tables: RwLock<Tables>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_err<T>(_: T) -> ProtocolError {
    ProtocolError::Custom(constants::ERR_REGISTRY_LOCK.to_string())
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                by_name: HashMap::new(),
                by_id: HashMap::new(),
                next_id: FIRST_APPLICATION as u32,
            }),
        }
    }

    /// Register a packet type and return its local id. Idempotent.
    pub fn register<T: Packet>(&self) -> Result<u16> {
        if let Some(entry) = self.lookup(T::NAME)? {
            return Self::check_same(&entry, &T::descriptor()).map(|_| entry.id);
        }
        Ok(self.insert(Cow::Borrowed(T::NAME), T::descriptor())?.id)
    }

    /// Register a descriptor learned at runtime.
    pub fn register_descriptor(&self, descriptor: TypeDescriptor) -> Result<Arc<TypeEntry>> {
        descriptor
            .validate()
            .map_err(ProtocolError::SerializationError)?;
        if let Some(entry) = self.lookup(&descriptor.name)? {
            Self::check_same(&entry, &descriptor)?;
            return Ok(entry);
        }
        self.insert(Cow::Owned(descriptor.name.clone()), descriptor)
    }

    fn check_same(entry: &TypeEntry, descriptor: &TypeDescriptor) -> Result<()> {
        if entry.descriptor.schema == descriptor.schema {
            Ok(())
        } else {
            Err(ProtocolError::SerializationError(format!(
                "{}: {}",
                constants::ERR_SCHEMA_MISMATCH,
                descriptor.name
            )))
        }
    }

    fn insert(&self, name: Cow<'static, str>, descriptor: TypeDescriptor) -> Result<Arc<TypeEntry>> {
        let mut tables = self.tables.write().map_err(lock_err)?;
        // another caller may have won the race since the read
        if let Some(existing) = tables.by_name.get(&name) {
            let existing = Arc::clone(existing);
            drop(tables);
            Self::check_same(&existing, &descriptor)?;
            return Ok(existing);
        }
        if tables.next_id > u16::MAX as u32 {
            return Err(ProtocolError::SerializationError(
                constants::ERR_TYPE_ID_EXHAUSTED.into(),
            ));
        }
        let id = tables.next_id as u16;
        tables.next_id += 1;

        let entry = Arc::new(TypeEntry { id, descriptor });
        tables.by_name.insert(name, Arc::clone(&entry));
        tables.by_id.insert(id, Arc::clone(&entry));
        debug!(id, name = %entry.name(), "Registered packet type");
        Ok(entry)
    }

    pub fn lookup(&self, name: &str) -> Result<Option<Arc<TypeEntry>>> {
        let tables = self.tables.read().map_err(lock_err)?;
        Ok(tables.by_name.get(name).cloned())
    }

    /// Resolve a local id.
    pub fn resolve(&self, id: u16) -> Result<Option<Arc<TypeEntry>>> {
        let tables = self.tables.read().map_err(lock_err)?;
        Ok(tables.by_id.get(&id).cloned())
    }

    pub fn len(&self) -> usize {
        self.tables.read().map(|t| t.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What one connection has agreed with its peer, in each direction.
#[derive(Debug, Default)]
pub struct PeerTypes {
    /// Local ids announced (or being announced) to the peer
    outbound: Mutex<HashMap<u16, Arc<OnceCell<()>>>>,
    /// Peer ids mapped to local entries
    inbound: RwLock<HashMap<u16, Arc<TypeEntry>>>,
}

impl PeerTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cell guarding the single registration round trip for a local id.
    pub fn outbound_cell(&self, local_id: u16) -> Result<Arc<OnceCell<()>>> {
        let mut cells = self.outbound.lock().map_err(lock_err)?;
        Ok(Arc::clone(cells.entry(local_id).or_default()))
    }

    pub fn is_announced(&self, local_id: u16) -> bool {
        self.outbound
            .lock()
            .map(|cells| cells.get(&local_id).is_some_and(|c| c.initialized()))
            .unwrap_or(false)
    }

    pub fn resolve(&self, peer_id: u16) -> Result<Option<Arc<TypeEntry>>> {
        let inbound = self.inbound.read().map_err(lock_err)?;
        Ok(inbound.get(&peer_id).cloned())
    }

    /// Record the peer's announcement of `peer_id`.
    ///
    /// Re-announcing the same shape under the same id is accepted; anything else that
    /// would change what an already-agreed id means is refused.
    pub fn accept(
        &self,
        registry: &TypeRegistry,
        peer_id: u16,
        descriptor: TypeDescriptor,
        accept_unknown: bool,
    ) -> Result<Arc<TypeEntry>> {
        if peer_id < FIRST_APPLICATION {
            return Err(ProtocolError::SerializationError(format!(
                "type id {peer_id:#06x} is reserved"
            )));
        }
        descriptor
            .validate()
            .map_err(ProtocolError::SerializationError)?;

        if let Some(existing) = self.resolve(peer_id)? {
            return if existing.descriptor == descriptor {
                Ok(existing)
            } else {
                Err(ProtocolError::SerializationError(format!(
                    "peer id {peer_id:#06x} already bound to {}",
                    existing.name()
                )))
            };
        }

        let entry = match registry.lookup(&descriptor.name)? {
            Some(local) if local.descriptor.schema == descriptor.schema => local,
            Some(_) => {
                return Err(ProtocolError::SerializationError(format!(
                    "{}: {}",
                    constants::ERR_SCHEMA_MISMATCH,
                    descriptor.name
                )))
            }
            None if accept_unknown => registry.register_descriptor(descriptor)?,
            None => {
                return Err(ProtocolError::SerializationError(format!(
                    "{}: {}",
                    constants::ERR_UNKNOWN_TYPE,
                    descriptor.name
                )))
            }
        };

        let mut inbound = self.inbound.write().map_err(lock_err)?;
        inbound.insert(peer_id, Arc::clone(&entry));
        debug!(peer_id, local_id = entry.id, name = %entry.name(), "Peer type bound");
        Ok(entry)
    }
}

//! Flowplane Storage - Port Store Trait and In-Memory Implementation
//!
//! Defines the storage abstraction for ports and their host bindings, plus
//! the typed query model that registered hooks transform. The in-memory
//! implementation backs tests and development deployments; a SQL-backed
//! implementation satisfies the same trait in production.

use flowplane_core::{
    EntityType, FlowplaneError, FlowplaneResult, NetworkId, Port, PortBinding, PortId,
    PortUpdate, StorageError,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

// ============================================================================
// QUERY MODEL
// ============================================================================

/// Typed query over ports, transformed by registered query hooks before the
/// store executes it.
///
/// Base predicates select ports; `join_binding` asks the store to left-outer
/// join each port's binding row into the result, so unbound ports still
/// appear with no binding. A host filter further restricts the result: one
/// value means exact match, several mean set membership, and an empty filter
/// leaves the query untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortQuery {
    join_binding: bool,
    host_filter: Option<Vec<String>>,
    port_id: Option<PortId>,
    tenant_id: Option<String>,
    network_id: Option<NetworkId>,
}

impl PortQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Left-outer-join the binding row into each result.
    pub fn join_binding(mut self) -> Self {
        self.join_binding = true;
        self
    }

    /// Restrict results to ports bound to the given hosts. An empty list is
    /// a no-op, matching an absent filter.
    pub fn with_host_filter(mut self, hosts: Vec<String>) -> Self {
        if !hosts.is_empty() {
            self.host_filter = Some(hosts);
        }
        self
    }

    pub fn with_id(mut self, port_id: PortId) -> Self {
        self.port_id = Some(port_id);
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_network(mut self, network_id: NetworkId) -> Self {
        self.network_id = Some(network_id);
        self
    }

    pub fn joins_binding(&self) -> bool {
        self.join_binding
    }

    pub fn host_filter(&self) -> Option<&[String]> {
        self.host_filter.as_deref()
    }
}

/// A port together with its joined binding row, when the query asked for the
/// join and a binding exists.
#[derive(Debug, Clone, PartialEq)]
pub struct PortRow {
    pub port: Port,
    pub binding: Option<PortBinding>,
}

// ============================================================================
// STORE TRAIT
// ============================================================================

/// Storage trait for ports and their host bindings.
///
/// All operations are synchronous and individually atomic. `binding_upsert`
/// in particular performs its read-or-insert as one atomic operation; a
/// concurrent duplicate insert surfaces as a constraint violation from the
/// storage layer, which callers treat as a retryable conflict.
pub trait PortStore: Send + Sync {
    // === Port Operations ===

    /// Insert a new port.
    fn port_insert(&self, port: &Port) -> FlowplaneResult<()>;

    /// Get a port by ID.
    fn port_get(&self, id: PortId) -> FlowplaneResult<Option<Port>>;

    /// Apply the base fields of an update payload. The binding attribute is
    /// not handled here; the bindings crate persists it separately.
    fn port_update(&self, id: PortId, update: &PortUpdate) -> FlowplaneResult<Port>;

    /// Delete a port. Cascades to its binding row.
    fn port_delete(&self, id: PortId) -> FlowplaneResult<()>;

    /// Execute a query, returning joined rows in deterministic id order.
    fn port_query(&self, query: &PortQuery) -> FlowplaneResult<Vec<PortRow>>;

    // === Binding Operations ===

    /// Get the binding row for a port, if one was ever written.
    fn binding_get(&self, port_id: PortId) -> FlowplaneResult<Option<PortBinding>>;

    /// Insert or overwrite the binding row for a port. Fails with a
    /// foreign-key violation when the port does not exist.
    fn binding_upsert(&self, port_id: PortId, host: &str) -> FlowplaneResult<PortBinding>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// In-memory port store.
///
/// Lock order is ports before bindings everywhere, so the cascade delete and
/// the FK-checked upsert cannot deadlock each other.
#[derive(Debug, Default)]
pub struct MemoryPortStore {
    ports: Arc<RwLock<HashMap<PortId, Port>>>,
    bindings: Arc<RwLock<HashMap<PortId, PortBinding>>>,
}

impl MemoryPortStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all stored data.
    pub fn clear(&self) {
        self.ports.write().unwrap().clear();
        self.bindings.write().unwrap().clear();
    }

    /// Get count of stored ports.
    pub fn port_count(&self) -> usize {
        self.ports.read().unwrap().len()
    }

    /// Get count of stored binding rows.
    pub fn binding_count(&self) -> usize {
        self.bindings.read().unwrap().len()
    }
}

impl PortStore for MemoryPortStore {
    // === Port Operations ===

    fn port_insert(&self, port: &Port) -> FlowplaneResult<()> {
        let mut ports = self.ports.write().unwrap();
        if ports.contains_key(&port.port_id) {
            return Err(FlowplaneError::Storage(StorageError::AlreadyExists {
                entity_type: EntityType::Port,
                id: port.port_id,
            }));
        }
        ports.insert(port.port_id, port.clone());
        Ok(())
    }

    fn port_get(&self, id: PortId) -> FlowplaneResult<Option<Port>> {
        let ports = self.ports.read().unwrap();
        Ok(ports.get(&id).cloned())
    }

    fn port_update(&self, id: PortId, update: &PortUpdate) -> FlowplaneResult<Port> {
        let mut ports = self.ports.write().unwrap();
        let port = ports
            .get_mut(&id)
            .ok_or(FlowplaneError::Storage(StorageError::NotFound {
                entity_type: EntityType::Port,
                id,
            }))?;

        if let Some(ref name) = update.name {
            port.name = name.clone();
        }
        if let Some(admin_state_up) = update.admin_state_up {
            port.admin_state_up = admin_state_up;
        }
        if let Some(ref device_id) = update.device_id {
            port.device_id = Some(device_id.clone());
        }
        if let Some(ref device_owner) = update.device_owner {
            port.device_owner = Some(device_owner.clone());
        }
        port.updated_at = chrono::Utc::now();

        Ok(port.clone())
    }

    fn port_delete(&self, id: PortId) -> FlowplaneResult<()> {
        let mut ports = self.ports.write().unwrap();
        if ports.remove(&id).is_none() {
            return Err(FlowplaneError::Storage(StorageError::NotFound {
                entity_type: EntityType::Port,
                id,
            }));
        }
        // Cascade: the binding row lives and dies with its port.
        self.bindings.write().unwrap().remove(&id);
        Ok(())
    }

    fn port_query(&self, query: &PortQuery) -> FlowplaneResult<Vec<PortRow>> {
        let ports = self.ports.read().unwrap();
        let bindings = self.bindings.read().unwrap();

        let mut rows: Vec<PortRow> = ports
            .values()
            .filter(|p| query.port_id.map_or(true, |id| p.port_id == id))
            .filter(|p| {
                query
                    .tenant_id
                    .as_ref()
                    .map_or(true, |t| &p.tenant_id == t)
            })
            .filter(|p| query.network_id.map_or(true, |n| p.network_id == n))
            .map(|p| PortRow {
                port: p.clone(),
                binding: if query.join_binding {
                    bindings.get(&p.port_id).cloned()
                } else {
                    None
                },
            })
            .collect();

        if let Some(values) = query.host_filter() {
            rows.retain(|row| match &row.binding {
                Some(binding) if values.len() == 1 => binding.host == values[0],
                Some(binding) => values.contains(&binding.host),
                // The join is outer, but a host filter only matches bound ports.
                None => false,
            });
        }

        // UUIDv7 ids sort by creation time.
        rows.sort_by_key(|row| row.port.port_id);
        Ok(rows)
    }

    // === Binding Operations ===

    fn binding_get(&self, port_id: PortId) -> FlowplaneResult<Option<PortBinding>> {
        let bindings = self.bindings.read().unwrap();
        Ok(bindings.get(&port_id).cloned())
    }

    fn binding_upsert(&self, port_id: PortId, host: &str) -> FlowplaneResult<PortBinding> {
        let ports = self.ports.read().unwrap();
        if !ports.contains_key(&port_id) {
            return Err(FlowplaneError::Storage(StorageError::ForeignKeyViolation {
                entity_type: EntityType::PortBinding,
                id: port_id,
            }));
        }

        let mut bindings = self.bindings.write().unwrap();
        let binding = bindings
            .entry(port_id)
            .and_modify(|b| b.host = host.to_string())
            .or_insert_with(|| PortBinding {
                port_id,
                host: host.to_string(),
            });
        Ok(binding.clone())
    }
}

// ============================================================================
// TESTS
// ============================================================================


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================

#[cfg(test)]
mod prop_tests {
    use super::*;
    use chrono::Utc;
    use flowplane_core::{new_entity_id, PortStatus};
    use proptest::prelude::*;

    fn make_port() -> Port {
        Port {
            port_id: new_entity_id(),
            tenant_id: "tenant-a".to_string(),
            network_id: new_entity_id(),
            name: "port".to_string(),
            mac_address: "fa:16:3e:00:00:01".to_string(),
            admin_state_up: true,
            status: PortStatus::Active,
            device_id: None,
            device_owner: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Property: any sequence of upserts for one port leaves exactly one
        /// binding row holding the last written host.
        #[test]
        fn prop_upsert_sequence_keeps_single_row(
            hosts in proptest::collection::vec("[a-z0-9-]{0,32}", 1..8)
        ) {
            let store = MemoryPortStore::new();
            let port = make_port();
            store.port_insert(&port).unwrap();

            for host in &hosts {
                store.binding_upsert(port.port_id, host).unwrap();
            }

            prop_assert_eq!(store.binding_count(), 1);
            let stored = store.binding_get(port.port_id).unwrap().unwrap();
            prop_assert_eq!(&stored.host, hosts.last().unwrap());
        }

        /// Property: a host-filtered query returns a subset of the unfiltered
        /// query, and every returned row matches the filter.
        #[test]
        fn prop_host_filter_selects_subset(
            hosts in proptest::collection::vec("[a-c]", 1..10),
            wanted in proptest::collection::vec("[a-c]", 0..3)
        ) {
            let store = MemoryPortStore::new();
            for host in &hosts {
                let port = make_port();
                store.port_insert(&port).unwrap();
                store.binding_upsert(port.port_id, host).unwrap();
            }

            let all = store.port_query(&PortQuery::new().join_binding()).unwrap();
            let filtered = store
                .port_query(
                    &PortQuery::new()
                        .join_binding()
                        .with_host_filter(wanted.clone()),
                )
                .unwrap();

            prop_assert!(filtered.len() <= all.len());
            if wanted.is_empty() {
                prop_assert_eq!(filtered.len(), all.len());
            } else {
                let expected = hosts.iter().filter(|h| wanted.contains(h)).count();
                prop_assert_eq!(filtered.len(), expected);
                for row in &filtered {
                    prop_assert!(wanted.contains(&row.binding.as_ref().unwrap().host));
                }
            }
        }

        /// Property: delete cascades, so no binding row ever outlives its port.
        #[test]
        fn prop_no_orphan_binding_after_delete(count in 1usize..10) {
            let store = MemoryPortStore::new();
            let mut ids = Vec::new();
            for _ in 0..count {
                let port = make_port();
                store.port_insert(&port).unwrap();
                store.binding_upsert(port.port_id, "compute-1").unwrap();
                ids.push(port.port_id);
            }

            for id in &ids {
                store.port_delete(*id).unwrap();
            }

            prop_assert_eq!(store.port_count(), 0);
            prop_assert_eq!(store.binding_count(), 0);
        }
    }
}

//! Flowplane Bindings - Port Host-Binding Extension
//!
//! Associates each port with the compute host it is bound to and exposes that
//! association through the port representation. The extension contributes a
//! query hook (joins and filters on the binding row), a binding writer for
//! create/update paths, a representation extender, and an authorization
//! filter over binding-prefixed fields.
//!
//! Hooks are registered explicitly on the [`PortService`] builder and invoked
//! in registration order; the service itself knows nothing about host
//! bindings beyond the hook seams.

use flowplane_core::{
    new_entity_id, validate_host, AttrValue, EntityType, FilterMap, FlowplaneError,
    FlowplaneResult, Port, PortCreate, PortId, PortStatus, PortUpdate, PortView, PolicyEngine,
    RequestContext, StorageError, ValidationError, BINDING_PREFIX, HOST_ID,
};
use flowplane_storage::{PortQuery, PortRow, PortStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// HOOK TRAITS
// ============================================================================

/// Query-shaping hook invoked on every port read.
///
/// `augment` adapts the base query (joins, projections); `filter` applies any
/// caller-supplied filter values the hook understands. Both are pure query
/// transformations, composable with other hooks on the same entity.
pub trait PortQueryHook: Send + Sync {
    fn augment(&self, query: PortQuery) -> PortQuery;

    fn filter(&self, query: PortQuery, filters: &FilterMap) -> PortQuery;
}

/// Representation-extending hook invoked once per port whenever a view is
/// assembled from a storage row.
pub trait PortViewExtender: Send + Sync {
    fn extend(&self, view: &mut PortView, row: &PortRow);
}

// ============================================================================
// HOST BINDING EXTENSION
// ============================================================================

/// The host-binding extension.
///
/// Owns the optional map of extra binding attributes a deployment declares;
/// those are merged into every port view alongside the host field.
#[derive(Debug, Clone, Default)]
pub struct HostBindingExtension {
    extra_binding_attrs: BTreeMap<String, serde_json::Value>,
}

impl HostBindingExtension {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an extra binding attribute merged into every port view.
    pub fn with_extra_attr(mut self, field: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra_binding_attrs.insert(field.into(), value);
        self
    }

    pub fn extra_binding_attrs(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.extra_binding_attrs
    }

    /// Merge the resolved host (and any declared extra binding attributes)
    /// into a port view. Extra attributes overwrite same-named fields.
    pub fn merge_host(&self, view: &mut PortView, host: Option<&str>) {
        match host {
            Some(host) => view.set(HOST_ID, serde_json::json!(host)),
            None => view.set(HOST_ID, serde_json::Value::Null),
        }
        for (field, value) in &self.extra_binding_attrs {
            view.set(field.clone(), value.clone());
        }
    }

    /// Persist the requested host binding on a create or update path and
    /// merge the resolved host into the in-progress view.
    ///
    /// `Unset` leaves storage untouched and reads back whatever is stored;
    /// `Set` upserts the given host; `Null` upserts the empty string, the
    /// explicit-clear form of a column that cannot be absent.
    pub fn process_port_binding(
        &self,
        store: &dyn PortStore,
        port_id: PortId,
        requested: &AttrValue<String>,
        view: &mut PortView,
    ) -> FlowplaneResult<()> {
        let host = match requested {
            AttrValue::Unset => store.binding_get(port_id)?.map(|b| b.host),
            AttrValue::Set(host) => {
                validate_host(host)?;
                let binding = store.binding_upsert(port_id, host)?;
                debug!(port_id = %port_id, host = %binding.host, "bound port to host");
                Some(binding.host)
            }
            AttrValue::Null => {
                let binding = store.binding_upsert(port_id, "")?;
                debug!(port_id = %port_id, "cleared port host binding");
                Some(binding.host)
            }
        };
        self.merge_host(view, host.as_deref());
        Ok(())
    }

    /// The stored host for a port. `None` only when no binding row exists;
    /// an empty-string host is a distinct, valid value and is returned as is.
    pub fn get_port_host(
        &self,
        store: &dyn PortStore,
        port_id: PortId,
    ) -> FlowplaneResult<Option<String>> {
        Ok(store.binding_get(port_id)?.map(|b| b.host))
    }

    /// Remove every binding-prefixed field the caller may not view.
    ///
    /// Each field is checked independently via the `get_port:<field>` rule
    /// against the complete candidate view; removals happen only after all
    /// checks, so the policy always sees the full payload. Denial is silent.
    pub fn filter_binding_fields(
        &self,
        policy: &dyn PolicyEngine,
        context: &RequestContext,
        view: &mut PortView,
    ) -> FlowplaneResult<()> {
        let mut to_remove = Vec::new();
        for field in view.field_names() {
            if field.starts_with(BINDING_PREFIX) {
                let rule = format!("get_port:{field}");
                if !policy.check(context, &rule, view)? {
                    to_remove.push(field);
                }
            }
        }
        for field in &to_remove {
            view.remove(field);
        }
        Ok(())
    }
}

impl PortQueryHook for HostBindingExtension {
    fn augment(&self, query: PortQuery) -> PortQuery {
        query.join_binding()
    }

    fn filter(&self, query: PortQuery, filters: &FilterMap) -> PortQuery {
        match filters.get(HOST_ID) {
            Some(values) if !values.is_empty() => query.with_host_filter(values.clone()),
            _ => query,
        }
    }
}

impl PortViewExtender for HostBindingExtension {
    fn extend(&self, view: &mut PortView, row: &PortRow) {
        let host = row.binding.as_ref().map(|b| b.host.as_str());
        self.merge_host(view, host);
    }
}

// ============================================================================
// PORT SERVICE
// ============================================================================

/// Port-management service the extension composes onto.
///
/// Holds the store, the policy engine, and the hooks registered at
/// construction. Every read shapes its query through the query hooks and
/// assembles views through the extenders, both in registration order; write
/// paths additionally run the binding writer when the extension is
/// registered.
pub struct PortService {
    store: Arc<dyn PortStore>,
    policy: Arc<dyn PolicyEngine>,
    query_hooks: Vec<Arc<dyn PortQueryHook>>,
    extenders: Vec<Arc<dyn PortViewExtender>>,
    binding: Option<Arc<HostBindingExtension>>,
}

/// Builder assembling a [`PortService`] with its registered hooks.
pub struct PortServiceBuilder {
    store: Arc<dyn PortStore>,
    policy: Arc<dyn PolicyEngine>,
    query_hooks: Vec<Arc<dyn PortQueryHook>>,
    extenders: Vec<Arc<dyn PortViewExtender>>,
    binding: Option<Arc<HostBindingExtension>>,
}

impl PortServiceBuilder {
    /// Register the host-binding extension as query hook, view extender, and
    /// binding writer. Registration is the capability: a service built
    /// without it never touches binding state.
    pub fn with_host_binding(mut self, extension: HostBindingExtension) -> Self {
        let extension = Arc::new(extension);
        self.query_hooks.push(extension.clone());
        self.extenders.push(extension.clone());
        self.binding = Some(extension);
        self
    }

    /// Register an additional query hook, invoked after earlier ones.
    pub fn with_query_hook(mut self, hook: Arc<dyn PortQueryHook>) -> Self {
        self.query_hooks.push(hook);
        self
    }

    /// Register an additional view extender, invoked after earlier ones.
    pub fn with_view_extender(mut self, extender: Arc<dyn PortViewExtender>) -> Self {
        self.extenders.push(extender);
        self
    }

    pub fn build(self) -> PortService {
        PortService {
            store: self.store,
            policy: self.policy,
            query_hooks: self.query_hooks,
            extenders: self.extenders,
            binding: self.binding,
        }
    }
}

impl PortService {
    pub fn builder(store: Arc<dyn PortStore>, policy: Arc<dyn PolicyEngine>) -> PortServiceBuilder {
        PortServiceBuilder {
            store,
            policy,
            query_hooks: Vec::new(),
            extenders: Vec::new(),
            binding: None,
        }
    }

    /// Whether the host-binding extension was registered at construction.
    pub fn has_host_binding(&self) -> bool {
        self.binding.is_some()
    }

    /// Create a port, persisting any requested host binding.
    pub fn create_port(
        &self,
        context: &RequestContext,
        payload: PortCreate,
    ) -> FlowplaneResult<PortView> {
        if payload.mac_address.is_empty() {
            return Err(FlowplaneError::Validation(
                ValidationError::RequiredFieldMissing {
                    field: "mac_address".to_string(),
                },
            ));
        }
        if let AttrValue::Set(ref host) = payload.binding_host {
            validate_host(host)?;
        }

        let now = chrono::Utc::now();
        let port = Port {
            port_id: new_entity_id(),
            tenant_id: payload.tenant_id,
            network_id: payload.network_id,
            name: payload.name,
            mac_address: payload.mac_address,
            admin_state_up: payload.admin_state_up,
            status: PortStatus::Down,
            device_id: payload.device_id,
            device_owner: payload.device_owner,
            created_at: now,
            updated_at: now,
        };
        self.store.port_insert(&port)?;
        debug!(port_id = %port.port_id, network_id = %port.network_id, "created port");

        let mut view = PortView::from(&port);
        if let Some(ref binding) = self.binding {
            binding.process_port_binding(
                self.store.as_ref(),
                port.port_id,
                &payload.binding_host,
                &mut view,
            )?;
        }
        self.apply_view_auth(context, &mut view)?;
        Ok(view)
    }

    /// Update a port's base fields and, when supplied, its host binding.
    pub fn update_port(
        &self,
        context: &RequestContext,
        port_id: PortId,
        update: PortUpdate,
    ) -> FlowplaneResult<PortView> {
        // Reject an invalid host before any field is persisted; the base
        // update and the binding write succeed or fail together.
        if let AttrValue::Set(ref host) = update.binding_host {
            validate_host(host)?;
        }

        let port = self.store.port_update(port_id, &update)?;
        debug!(port_id = %port.port_id, "updated port");

        let mut view = PortView::from(&port);
        if let Some(ref binding) = self.binding {
            binding.process_port_binding(
                self.store.as_ref(),
                port_id,
                &update.binding_host,
                &mut view,
            )?;
        }
        self.apply_view_auth(context, &mut view)?;
        Ok(view)
    }

    /// Get a single port view.
    pub fn get_port(
        &self,
        context: &RequestContext,
        port_id: PortId,
    ) -> FlowplaneResult<PortView> {
        let query = self.shape_query(context, PortQuery::new().with_id(port_id), &FilterMap::new());
        let mut rows = self.store.port_query(&query)?;
        let row = rows
            .pop()
            .ok_or(FlowplaneError::Storage(StorageError::NotFound {
                entity_type: EntityType::Port,
                id: port_id,
            }))?;
        self.make_view(context, &row)
    }

    /// List port views matching the caller-supplied filters.
    pub fn list_ports(
        &self,
        context: &RequestContext,
        filters: &FilterMap,
    ) -> FlowplaneResult<Vec<PortView>> {
        let query = self.shape_query(context, PortQuery::new(), filters);
        let rows = self.store.port_query(&query)?;
        rows.iter().map(|row| self.make_view(context, row)).collect()
    }

    /// Delete a port; its binding row goes with it.
    pub fn delete_port(&self, _context: &RequestContext, port_id: PortId) -> FlowplaneResult<()> {
        self.store.port_delete(port_id)?;
        debug!(port_id = %port_id, "deleted port");
        Ok(())
    }

    /// Fold the registered query hooks over a base query, in registration
    /// order, scoping non-admin callers to their own tenant first.
    fn shape_query(
        &self,
        context: &RequestContext,
        base: PortQuery,
        filters: &FilterMap,
    ) -> PortQuery {
        let mut query = base;
        if !context.is_admin {
            if let Some(ref tenant_id) = context.tenant_id {
                query = query.with_tenant(tenant_id.clone());
            }
        }
        for hook in &self.query_hooks {
            query = hook.augment(query);
            query = hook.filter(query, filters);
        }
        query
    }

    /// Assemble the outward-facing view of a storage row: base fields, then
    /// every registered extender in order, then the authorization filter.
    fn make_view(&self, context: &RequestContext, row: &PortRow) -> FlowplaneResult<PortView> {
        let mut view = PortView::from(&row.port);
        for extender in &self.extenders {
            extender.extend(&mut view, row);
        }
        self.apply_view_auth(context, &mut view)?;
        Ok(view)
    }

    fn apply_view_auth(
        &self,
        context: &RequestContext,
        view: &mut PortView,
    ) -> FlowplaneResult<()> {
        if let Some(ref binding) = self.binding {
            binding.filter_binding_fields(self.policy.as_ref(), context, view)?;
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================

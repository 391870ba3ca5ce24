//! Flowplane Core - Entity Types
//!
//! Pure data structures shared by the storage and bindings crates: identifiers,
//! port and binding entities, tri-state attribute values, the outward-facing
//! port representation, the policy-engine seam, and error types. No storage
//! logic lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Entity identifier using UUIDv7 for timestamp-sortable IDs.
pub type EntityId = Uuid;

/// Identifier of a port.
pub type PortId = Uuid;

/// Identifier of a network.
pub type NetworkId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

// ============================================================================
// WIRE NAMES AND LIMITS
// ============================================================================

/// Prefix shared by every binding-related field in a port representation.
pub const BINDING_PREFIX: &str = "binding";

/// Representation field carrying the bound host.
pub const HOST_ID: &str = "binding:host_id";

/// Maximum length of a stored host name.
pub const MAX_HOST_LEN: usize = 255;

/// Validate a host value against the storage column limit.
/// Empty strings are valid; over-long values are not.
pub fn validate_host(host: &str) -> Result<(), ValidationError> {
    if host.len() > MAX_HOST_LEN {
        return Err(ValidationError::ValueTooLong {
            field: HOST_ID.to_string(),
            max: MAX_HOST_LEN,
            got: host.len(),
        });
    }
    Ok(())
}

// ============================================================================
// ENUMS
// ============================================================================

/// Entity type discriminator for storage errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Port,
    PortBinding,
}

/// Operational status of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortStatus {
    Active,
    Down,
    Build,
    Error,
}

// ============================================================================
// TRI-STATE ATTRIBUTES
// ============================================================================

/// Tri-state attribute value for update payloads.
///
/// Distinguishes "field not supplied" (`Unset`) from "field explicitly
/// cleared" (`Null`) from "field set to a value" (`Set`). Write paths branch
/// on this: `Unset` preserves stored state, the other two overwrite it.
/// Deserialization maps a missing field to `Unset` (via `#[serde(default)]`
/// on the containing struct field), JSON `null` to `Null`, and anything else
/// to `Set`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AttrValue<T> {
    #[default]
    Unset,
    Null,
    Set(T),
}

impl<T> AttrValue<T> {
    /// True when the attribute was not supplied at all.
    pub fn is_unset(&self) -> bool {
        matches!(self, AttrValue::Unset)
    }

    /// True when the attribute was supplied, whether as a value or as null.
    pub fn is_set(&self) -> bool {
        !self.is_unset()
    }

    /// True when the attribute was explicitly cleared.
    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Null)
    }

    /// The contained value, if any.
    pub fn as_option(&self) -> Option<&T> {
        match self {
            AttrValue::Set(value) => Some(value),
            _ => None,
        }
    }

    /// Consume into the contained value, if any.
    pub fn into_option(self) -> Option<T> {
        match self {
            AttrValue::Set(value) => Some(value),
            _ => None,
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for AttrValue<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // A field that is present deserializes here; absence is handled by
        // `#[serde(default)]` on the containing struct, which yields Unset.
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(value) => AttrValue::Set(value),
            None => AttrValue::Null,
        })
    }
}

impl<T: Serialize> Serialize for AttrValue<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            AttrValue::Set(value) => value.serialize(serializer),
            _ => serializer.serialize_none(),
        }
    }
}

// ============================================================================
// ENTITIES
// ============================================================================

/// Port - logical network attachment point.
/// Owned by the port-management service; the binding extension only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub port_id: PortId,
    pub tenant_id: String,
    pub network_id: NetworkId,
    pub name: String,
    pub mac_address: String,
    pub admin_state_up: bool,
    pub status: PortStatus,
    pub device_id: Option<String>,
    pub device_owner: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Association of a port to the compute host where it is realized.
/// At most one row per port; lives and dies with the owning port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub port_id: PortId,
    /// Bound host name. Required but may legitimately be the empty string.
    pub host: String,
}

// ============================================================================
// PAYLOADS
// ============================================================================

/// Submitted payload for port creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortCreate {
    pub tenant_id: String,
    pub network_id: NetworkId,
    #[serde(default)]
    pub name: String,
    pub mac_address: String,
    #[serde(default = "default_admin_state_up")]
    pub admin_state_up: bool,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_owner: Option<String>,
    /// Requested host binding. Unset leaves the port unbound at creation.
    #[serde(
        rename = "binding:host_id",
        default,
        skip_serializing_if = "AttrValue::is_unset"
    )]
    pub binding_host: AttrValue<String>,
}

fn default_admin_state_up() -> bool {
    true
}

/// Submitted payload for port update.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PortUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub admin_state_up: Option<bool>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_owner: Option<String>,
    /// Requested host binding. Unset preserves whatever is stored.
    #[serde(
        rename = "binding:host_id",
        default,
        skip_serializing_if = "AttrValue::is_unset"
    )]
    pub binding_host: AttrValue<String>,
}

// ============================================================================
// REPRESENTATION
// ============================================================================

/// Outward-facing key/value payload describing a port, as returned to API
/// callers. Assembled from a [`Port`] and then extended and filtered by the
/// registered hooks.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct PortView(BTreeMap<String, serde_json::Value>);

impl PortView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, overwriting any previous value.
    pub fn set(&mut self, field: impl Into<String>, value: serde_json::Value) {
        self.0.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.0.get(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<serde_json::Value> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Snapshot of the current field names, for check-then-remove passes that
    /// must not hold a borrow across mutation.
    pub fn field_names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&Port> for PortView {
    fn from(port: &Port) -> Self {
        let mut view = PortView::new();
        view.set("id", serde_json::json!(port.port_id));
        view.set("tenant_id", serde_json::json!(port.tenant_id));
        view.set("network_id", serde_json::json!(port.network_id));
        view.set("name", serde_json::json!(port.name));
        view.set("mac_address", serde_json::json!(port.mac_address));
        view.set("admin_state_up", serde_json::json!(port.admin_state_up));
        view.set("status", serde_json::json!(port.status));
        view.set("device_id", serde_json::json!(port.device_id));
        view.set("device_owner", serde_json::json!(port.device_owner));
        view
    }
}

/// Filter values as submitted to list operations: field name to one or more
/// requested values.
pub type FilterMap = BTreeMap<String, Vec<String>>;

// ============================================================================
// REQUEST CONTEXT AND POLICY
// ============================================================================

/// Caller context evaluated by policy rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub is_admin: bool,
}

impl RequestContext {
    /// Context with administrative privileges.
    pub fn admin() -> Self {
        Self {
            is_admin: true,
            ..Self::default()
        }
    }

    /// Unprivileged context scoped to a tenant.
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            ..Self::default()
        }
    }
}

/// Authorization seam consulted per field by the binding view filter.
///
/// Implementations decide whether `context` may exercise `rule` against the
/// fully assembled candidate `target`. Evaluation failures propagate to the
/// caller unchanged.
pub trait PolicyEngine: Send + Sync {
    fn check(
        &self,
        context: &RequestContext,
        rule: &str,
        target: &PortView,
    ) -> FlowplaneResult<bool>;
}

/// Policy engine that allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PolicyEngine for AllowAll {
    fn check(&self, _: &RequestContext, _: &str, _: &PortView) -> FlowplaneResult<bool> {
        Ok(true)
    }
}

/// Policy engine backed by an explicit deny list of rule names.
#[derive(Debug, Clone, Default)]
pub struct DenyRules {
    denied: BTreeSet<String>,
}

impl DenyRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(mut self, rule: impl Into<String>) -> Self {
        self.denied.insert(rule.into());
        self
    }
}

impl PolicyEngine for DenyRules {
    fn check(&self, _: &RequestContext, rule: &str, _: &PortView) -> FlowplaneResult<bool> {
        Ok(!self.denied.contains(rule))
    }
}

/// Policy engine that restricts a set of rule prefixes to administrative
/// callers, the common deployment default for binding attributes.
#[derive(Debug, Clone, Default)]
pub struct AdminOnlyRules {
    guarded: Vec<String>,
}

impl AdminOnlyRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(mut self, rule_prefix: impl Into<String>) -> Self {
        self.guarded.push(rule_prefix.into());
        self
    }
}

impl PolicyEngine for AdminOnlyRules {
    fn check(
        &self,
        context: &RequestContext,
        rule: &str,
        _: &PortView,
    ) -> FlowplaneResult<bool> {
        if self.guarded.iter().any(|prefix| rule.starts_with(prefix.as_str())) {
            return Ok(context.is_admin);
        }
        Ok(true)
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity_type:?} with id {id}")]
    NotFound { entity_type: EntityType, id: Uuid },

    #[error("Entity already exists: {entity_type:?} with id {id}")]
    AlreadyExists { entity_type: EntityType, id: Uuid },

    #[error("Foreign key violation: {entity_type:?} references missing port {id}")]
    ForeignKeyViolation { entity_type: EntityType, id: Uuid },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Value too long for {field}: max {max}, got {got}")]
    ValueTooLong {
        field: String,
        max: usize,
        got: usize,
    },
}

/// Policy-engine evaluation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Policy evaluation failed for rule {rule}: {reason}")]
    EvaluationFailed { rule: String, reason: String },
}

/// Master error type for all flowplane operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlowplaneError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),
}

/// Result type alias for flowplane operations.
pub type FlowplaneResult<T> = Result<T, FlowplaneError>;

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_test_port() -> Port {
        Port {
            port_id: new_entity_id(),
            tenant_id: "tenant-a".to_string(),
            network_id: new_entity_id(),
            name: "test-port".to_string(),
            mac_address: "fa:16:3e:00:00:01".to_string(),
            admin_state_up: true,
            status: PortStatus::Active,
            device_id: None,
            device_owner: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[derive(Debug, Deserialize)]
    struct TriStateProbe {
        #[serde(default)]
        host: AttrValue<String>,
    }

    #[test]
    fn test_attr_value_missing_field_is_unset() {
        let probe: TriStateProbe = serde_json::from_str("{}").unwrap();
        assert_eq!(probe.host, AttrValue::Unset);
        assert!(!probe.host.is_set());
    }

    #[test]
    fn test_attr_value_null_is_explicit_clear() {
        let probe: TriStateProbe = serde_json::from_str(r#"{"host": null}"#).unwrap();
        assert_eq!(probe.host, AttrValue::Null);
        assert!(probe.host.is_set());
        assert!(probe.host.is_null());
    }

    #[test]
    fn test_attr_value_value_is_set() {
        let probe: TriStateProbe = serde_json::from_str(r#"{"host": "compute-1"}"#).unwrap();
        assert_eq!(probe.host, AttrValue::Set("compute-1".to_string()));
        assert_eq!(probe.host.as_option().map(String::as_str), Some("compute-1"));
    }

    #[test]
    fn test_port_update_payload_binding_field_name() {
        let update: PortUpdate =
            serde_json::from_str(r#"{"binding:host_id": "compute-7"}"#).unwrap();
        assert_eq!(update.binding_host, AttrValue::Set("compute-7".to_string()));
        assert!(update.name.is_none());
    }

    #[test]
    fn test_port_update_payload_without_binding_is_unset() {
        let update: PortUpdate = serde_json::from_str(r#"{"name": "renamed"}"#).unwrap();
        assert_eq!(update.binding_host, AttrValue::Unset);
    }

    #[test]
    fn test_port_view_from_port_has_base_fields() {
        let port = make_test_port();
        let view = PortView::from(&port);

        assert_eq!(
            view.get("id"),
            Some(&serde_json::json!(port.port_id))
        );
        assert_eq!(view.get("name"), Some(&serde_json::json!("test-port")));
        assert_eq!(view.get("status"), Some(&serde_json::json!("ACTIVE")));
        assert!(!view.contains(HOST_ID));
    }

    #[test]
    fn test_port_view_set_overwrites() {
        let mut view = PortView::new();
        view.set(HOST_ID, serde_json::json!("compute-1"));
        view.set(HOST_ID, serde_json::json!("compute-2"));
        assert_eq!(view.get(HOST_ID), Some(&serde_json::json!("compute-2")));
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_validate_host_accepts_empty_and_max() {
        assert!(validate_host("").is_ok());
        assert!(validate_host(&"h".repeat(MAX_HOST_LEN)).is_ok());
    }

    #[test]
    fn test_validate_host_rejects_over_long() {
        let err = validate_host(&"h".repeat(MAX_HOST_LEN + 1)).unwrap_err();
        assert!(matches!(err, ValidationError::ValueTooLong { .. }));
    }

    #[test]
    fn test_deny_rules_policy() {
        let policy = DenyRules::new().deny("get_port:binding:profile");
        let ctx = RequestContext::for_tenant("tenant-a");
        let view = PortView::new();

        assert!(!policy
            .check(&ctx, "get_port:binding:profile", &view)
            .unwrap());
        assert!(policy.check(&ctx, "get_port:binding:host_id", &view).unwrap());
    }

    #[test]
    fn test_admin_only_rules_policy() {
        let policy = AdminOnlyRules::new().guard("get_port:binding");
        let view = PortView::new();

        assert!(policy
            .check(&RequestContext::admin(), "get_port:binding:host_id", &view)
            .unwrap());
        assert!(!policy
            .check(
                &RequestContext::for_tenant("tenant-a"),
                "get_port:binding:host_id",
                &view
            )
            .unwrap());
        assert!(policy
            .check(&RequestContext::for_tenant("tenant-a"), "get_port:name", &view)
            .unwrap());
    }

    #[test]
    fn test_storage_error_display_not_found() {
        let err = StorageError::NotFound {
            entity_type: EntityType::PortBinding,
            id: Uuid::nil(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Entity not found"));
        assert!(msg.contains("PortBinding"));
        assert!(msg.contains("00000000-0000-0000-0000-000000000000"));
    }

    #[test]
    fn test_validation_error_display_value_too_long() {
        let err = ValidationError::ValueTooLong {
            field: HOST_ID.to_string(),
            max: MAX_HOST_LEN,
            got: 300,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("binding:host_id"));
        assert!(msg.contains("255"));
        assert!(msg.contains("300"));
    }

    #[test]
    fn test_flowplane_error_from_variants() {
        let storage = FlowplaneError::from(StorageError::NotFound {
            entity_type: EntityType::Port,
            id: Uuid::nil(),
        });
        assert!(matches!(storage, FlowplaneError::Storage(_)));

        let validation = FlowplaneError::from(ValidationError::RequiredFieldMissing {
            field: "mac_address".to_string(),
        });
        assert!(matches!(validation, FlowplaneError::Validation(_)));

        let policy = FlowplaneError::from(PolicyError::EvaluationFailed {
            rule: "get_port:binding:host_id".to_string(),
            reason: "engine unavailable".to_string(),
        });
        assert!(matches!(policy, FlowplaneError::Policy(_)));
    }
}

// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Property: a set attribute survives a serialize/deserialize pass.
        #[test]
        fn prop_attr_value_set_roundtrip(host in "[a-z0-9.-]{0,64}") {
            let update = PortUpdate {
                binding_host: AttrValue::Set(host.clone()),
                ..Default::default()
            };
            let encoded = serde_json::to_string(&update).unwrap();
            let decoded: PortUpdate = serde_json::from_str(&encoded).unwrap();
            prop_assert_eq!(decoded.binding_host, AttrValue::Set(host));
        }

        /// Property: an unset attribute is skipped on the wire and comes back
        /// unset, never as an explicit null.
        #[test]
        fn prop_attr_value_unset_is_skipped(name in "[a-z]{1,16}") {
            let update = PortUpdate {
                name: Some(name),
                ..Default::default()
            };
            let encoded = serde_json::to_string(&update).unwrap();
            prop_assert!(!encoded.contains("binding:host_id"));

            let decoded: PortUpdate = serde_json::from_str(&encoded).unwrap();
            prop_assert_eq!(decoded.binding_host, AttrValue::Unset);
        }

        /// Property: host validation is exactly a length check.
        #[test]
        fn prop_validate_host_is_length_check(len in 0usize..400) {
            let host = "h".repeat(len);
            let result = validate_host(&host);
            if len <= MAX_HOST_LEN {
                prop_assert!(result.is_ok());
            } else {
                prop_assert!(result.is_err());
            }
        }
    }
}

//! Policy objects, reconciliation requests and per-object results.
//!
//! Remote objects share an envelope (`id`, `name`, `type`, `properties`) and
//! are distinguished by their `type` string. [`PolicyObject`] is the tagged
//! union over the three kinds this crate manages; kind-specific fields are
//! only reachable after matching on the variant.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::batch::BatchResponse;

pub const DEFINITION_TYPE: &str = "Microsoft.Authorization/policyDefinitions";
pub const INITIATIVE_TYPE: &str = "Microsoft.Authorization/policySetDefinitions";
pub const ASSIGNMENT_TYPE: &str = "Microsoft.Authorization/policyAssignments";

/// Metadata key holding the [`TrackingMetadata`] block.
pub const TRACKING_KEY: &str = "gitHubPolicy";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PolicyObject {
    #[serde(rename = "Microsoft.Authorization/policyDefinitions")]
    Definition(PolicyDefinition),
    #[serde(rename = "Microsoft.Authorization/policySetDefinitions")]
    Initiative(PolicyInitiative),
    #[serde(rename = "Microsoft.Authorization/policyAssignments")]
    Assignment(PolicyAssignment),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDefinition {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub properties: DefinitionProperties,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_rule: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyInitiative {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub properties: InitiativeProperties,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiativeProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyAssignment {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<ManagedIdentity>,
    #[serde(default)]
    pub properties: AssignmentProperties,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub policy_definition_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforcement_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Managed identity attached to an assignment for remediation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedIdentity {
    #[serde(rename = "type")]
    pub identity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// Traceability block persisted under `properties.metadata.gitHubPolicy`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingMetadata {
    pub digest: String,
    #[serde(default)]
    pub repo_name: String,
    #[serde(default)]
    pub commit_sha: String,
    #[serde(default)]
    pub run_url: String,
    #[serde(default)]
    pub filepath: String,
}

// The remediation part of a policy rule: `then.details.roleDefinitionIds`.
#[derive(Deserialize)]
struct RemediationRule {
    then: RemediationEffect,
}

#[derive(Deserialize)]
struct RemediationEffect {
    details: RemediationDetails,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemediationDetails {
    #[serde(default)]
    role_definition_ids: Vec<String>,
}

impl PolicyDefinition {
    /// Full resource paths of the roles the rule's remediation effect needs.
    ///
    /// Effects without a `details` object (or whose details are an array,
    /// as for `append`) need no roles.
    pub fn role_definition_ids(&self) -> Vec<String> {
        self.properties
            .policy_rule
            .clone()
            .and_then(|rule| serde_json::from_value::<RemediationRule>(rule).ok())
            .map(|rule| rule.then.details.role_definition_ids)
            .unwrap_or_default()
    }
}

impl PolicyAssignment {
    pub fn principal_id(&self) -> Option<&str> {
        self.identity.as_ref()?.principal_id.as_deref()
    }

    /// Scope the assignment applies to, falling back to the scope embedded in its id.
    pub fn scope(&self) -> String {
        match &self.properties.scope {
            Some(scope) if !scope.is_empty() => scope.clone(),
            _ => scope_of(&self.id).to_string(),
        }
    }
}

/// The scope prefix of a resource id (everything before `/providers/Microsoft.Authorization/`).
pub fn scope_of(id: &str) -> &str {
    let lower = id.to_ascii_lowercase();
    match lower.find("/providers/microsoft.authorization/") {
        Some(idx) => &id[..idx],
        None => id,
    }
}

impl PolicyObject {
    pub fn kind(&self) -> PolicyKind {
        match self {
            Self::Definition(_) => PolicyKind::Definition,
            Self::Initiative(_) => PolicyKind::Initiative,
            Self::Assignment(_) => PolicyKind::Assignment,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Definition(d) => &d.id,
            Self::Initiative(i) => &i.id,
            Self::Assignment(a) => &a.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Definition(d) => &d.name,
            Self::Initiative(i) => &i.name,
            Self::Assignment(a) => &a.name,
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        match self {
            Self::Definition(d) => d.properties.display_name.as_deref(),
            Self::Initiative(i) => i.properties.display_name.as_deref(),
            Self::Assignment(a) => a.properties.display_name.as_deref(),
        }
    }

    /// The definition this object is grouped under in reports: its own id for
    /// definitions and initiatives, the referenced definition for assignments.
    pub fn policy_definition_id(&self) -> &str {
        match self {
            Self::Definition(d) => &d.id,
            Self::Initiative(i) => &i.id,
            Self::Assignment(a) => &a.properties.policy_definition_id,
        }
    }

    /// An object is valid when `id`, `name` and `type` are all present.
    /// `type` is guaranteed by the variant itself.
    pub fn is_valid(&self) -> bool {
        !self.id().is_empty() && !self.name().is_empty()
    }

    fn metadata(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Definition(d) => d.properties.metadata.as_ref(),
            Self::Initiative(i) => i.properties.metadata.as_ref(),
            Self::Assignment(a) => a.properties.metadata.as_ref(),
        }
    }

    fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        let metadata = match self {
            Self::Definition(d) => &mut d.properties.metadata,
            Self::Initiative(i) => &mut i.properties.metadata,
            Self::Assignment(a) => &mut a.properties.metadata,
        };
        metadata.get_or_insert_with(Map::new)
    }

    pub fn tracking(&self) -> Option<TrackingMetadata> {
        let block = self.metadata()?.get(TRACKING_KEY)?;
        serde_json::from_value(block.clone()).ok()
    }

    pub fn set_tracking(&mut self, tracking: &TrackingMetadata) -> crate::error::Result<()> {
        let block = serde_json::to_value(tracking)?;
        self.metadata_mut().insert(TRACKING_KEY.to_string(), block);
        Ok(())
    }

    /// A copy of this object without the tracking block, used for hashing.
    pub fn without_tracking(&self) -> Self {
        let mut copy = self.clone();
        let metadata = match &mut copy {
            Self::Definition(d) => &mut d.properties.metadata,
            Self::Initiative(i) => &mut i.properties.metadata,
            Self::Assignment(a) => &mut a.properties.metadata,
        };
        if let Some(map) = metadata {
            map.remove(TRACKING_KEY);
            if map.is_empty() {
                *metadata = None;
            }
        }
        copy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    Definition,
    Initiative,
    Assignment,
}

impl PolicyKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Definition => DEFINITION_TYPE,
            Self::Initiative => INITIATIVE_TYPE,
            Self::Assignment => ASSIGNMENT_TYPE,
        }
    }

    /// Remote error code meaning "no such object".
    pub fn not_found_code(&self) -> &'static str {
        match self {
            Self::Definition => "PolicyDefinitionNotFound",
            Self::Initiative => "PolicySetDefinitionNotFound",
            Self::Assignment => "PolicyAssignmentNotFound",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Definition => "definition",
            Self::Initiative => "initiative",
            Self::Assignment => "assignment",
        })
    }
}

/// A policy object read from the repository.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalPolicy {
    /// Repository-relative location.
    pub path: String,
    pub policy: PolicyObject,
}

/// Result of looking an object up in the remote service.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Found(PolicyObject),
    NotFound,
    Failed { code: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDetails {
    pub path: String,
    pub policy_in_code: PolicyObject,
    pub policy_in_service: FetchOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    None,
    ForceUpdate,
    ForceCreate,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::None => "NONE",
            Self::ForceUpdate => "FORCE_UPDATE",
            Self::ForceCreate => "FORCE_CREATE",
            Self::Delete => "DELETE",
        })
    }
}

/// An intended mutation of one remote object.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRequest {
    pub path: String,
    pub operation: Operation,
    pub policy: PolicyObject,
}

/// A request paired with the batch response that answered it.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub request: PolicyRequest,
    pub response: BatchResponse,
}

impl UpsertOutcome {
    pub fn error_message(&self) -> Option<String> {
        self.response.error_message()
    }
}

/// One role grant for an assignment's managed identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleRequest {
    pub scope: String,
    pub role_assignment_id: String,
    pub role_definition_id: String,
    pub principal_id: String,
    pub policy_assignment_id: String,
    pub policy_definition_id: String,
    pub path: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyStatus {
    Succeeded,
    Failed,
    /// Remote state may be inconsistent and needs an operator.
    Unresolved,
}

impl fmt::Display for PolicyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Unresolved => "UNRESOLVED",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultType {
    Definition,
    Initiative,
    Assignment,
    RoleAssignment,
}

impl From<PolicyKind> for ResultType {
    fn from(kind: PolicyKind) -> Self {
        match kind {
            PolicyKind::Definition => Self::Definition,
            PolicyKind::Initiative => Self::Initiative,
            PolicyKind::Assignment => Self::Assignment,
        }
    }
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Definition => "definition",
            Self::Initiative => "initiative",
            Self::Assignment => "assignment",
            Self::RoleAssignment => "roleAssignment",
        })
    }
}

/// Outcome record consumed by reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyResult {
    pub path: String,
    pub result_type: ResultType,
    pub operation: Operation,
    pub display_name: String,
    pub status: PolicyStatus,
    pub message: String,
    pub policy_definition_id: String,
}

impl PolicyResult {
    /// Build a result for a policy object, echoing its kind, name and definition id.
    pub fn for_policy(
        path: &str,
        policy: &PolicyObject,
        operation: Operation,
        status: PolicyStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            path: path.to_string(),
            result_type: policy.kind().into(),
            operation,
            display_name: policy
                .display_name()
                .unwrap_or_else(|| policy.name())
                .to_string(),
            status,
            message: message.into(),
            policy_definition_id: policy.policy_definition_id().to_string(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == PolicyStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition_json() -> Value {
        json!({
            "id": "/subscriptions/sub1/providers/Microsoft.Authorization/policyDefinitions/deny-public-ip",
            "name": "deny-public-ip",
            "type": DEFINITION_TYPE,
            "properties": {
                "displayName": "Deny public IP",
                "mode": "All",
                "policyRule": {
                    "if": { "field": "type", "equals": "Microsoft.Network/publicIPAddresses" },
                    "then": {
                        "effect": "deployIfNotExists",
                        "details": {
                            "type": "Microsoft.Network/publicIPAddresses",
                            "roleDefinitionIds": [
                                "/providers/Microsoft.Authorization/roleDefinitions/roleX",
                                "/providers/Microsoft.Authorization/roleDefinitions/roleY"
                            ]
                        }
                    }
                }
            }
        })
    }

    #[test]
    fn test_tagged_union_round_trip_preserves_unknown_fields() {
        let raw = definition_json();
        let policy: PolicyObject = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(policy.kind(), PolicyKind::Definition);
        assert_eq!(serde_json::to_value(&policy).unwrap(), raw);
    }

    #[test]
    fn test_role_definition_ids_from_rule() {
        let policy: PolicyObject = serde_json::from_value(definition_json()).unwrap();
        let PolicyObject::Definition(definition) = policy else {
            panic!("expected definition");
        };
        assert_eq!(definition.role_definition_ids().len(), 2);
    }

    #[test]
    fn test_role_definition_ids_absent_for_array_details() {
        let mut raw = definition_json();
        raw["properties"]["policyRule"]["then"] =
            json!({ "effect": "append", "details": [{ "field": "tags", "value": {} }] });
        let PolicyObject::Definition(definition) = serde_json::from_value(raw).unwrap() else {
            panic!("expected definition");
        };
        assert!(definition.role_definition_ids().is_empty());
    }

    #[test]
    fn test_missing_type_is_rejected() {
        let mut raw = definition_json();
        raw.as_object_mut().unwrap().remove("type");
        assert!(serde_json::from_value::<PolicyObject>(raw).is_err());
    }

    #[test]
    fn test_validity_requires_id_and_name() {
        let mut raw = definition_json();
        raw["name"] = json!("");
        let policy: PolicyObject = serde_json::from_value(raw).unwrap();
        assert!(!policy.is_valid());
    }

    #[test]
    fn test_tracking_set_and_strip() {
        let mut policy: PolicyObject = serde_json::from_value(definition_json()).unwrap();
        let original = policy.clone();
        let tracking = TrackingMetadata {
            digest: "abc".into(),
            repo_name: "org/repo".into(),
            commit_sha: "deadbeef".into(),
            run_url: "https://example/run/1".into(),
            filepath: "policies/deny".into(),
        };
        policy.set_tracking(&tracking).unwrap();
        assert_eq!(policy.tracking(), Some(tracking));
        assert_eq!(policy.without_tracking(), original);
    }

    #[test]
    fn test_assignment_scope_falls_back_to_id() {
        let assignment: PolicyObject = serde_json::from_value(json!({
            "id": "/subscriptions/sub1/resourceGroups/rg/providers/Microsoft.Authorization/policyAssignments/a1",
            "name": "a1",
            "type": ASSIGNMENT_TYPE,
            "properties": { "policyDefinitionId": "/subscriptions/sub1/providers/Microsoft.Authorization/policyDefinitions/d1" }
        }))
        .unwrap();
        let PolicyObject::Assignment(a) = assignment else {
            panic!("expected assignment");
        };
        assert_eq!(a.scope(), "/subscriptions/sub1/resourceGroups/rg");
        assert_eq!(a.principal_id(), None);
    }
}

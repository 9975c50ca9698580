//! Role grants for the managed identities of newly created assignments.

use std::collections::HashMap;

use serde_json::json;

use crate::batch::BatchClient;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::model::{
    FetchOutcome, Operation, PolicyAssignment, PolicyKind, PolicyObject, PolicyResult,
    PolicyStatus, ResultType, RoleRequest, UpsertOutcome,
};
use crate::reconcile::classify_fetch;

const CREATED: u16 = 201;

/// Created assignments whose response carries a managed identity principal.
///
/// Assignments that were only updated keep the grants made when they were
/// created.
pub fn identities_to_grant(assignments: &[UpsertOutcome]) -> Vec<(String, PolicyAssignment)> {
    assignments
        .iter()
        .filter(|o| matches!(o.request.operation, Operation::Create | Operation::ForceCreate))
        .filter_map(|o| {
            let created: PolicyObject = serde_json::from_value(o.response.content.clone()).ok()?;
            match created {
                PolicyObject::Assignment(a) if a.principal_id().is_some() => {
                    Some((o.request.path.clone(), a))
                }
                _ => None,
            }
        })
        .collect()
}

/// `/providers/Microsoft.Authorization/roleDefinitions/abc` -> `abc`
pub fn short_role_id(role_definition_id: &str) -> &str {
    role_definition_id
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(role_definition_id)
}

/// One request per (assignment, role) pair, each with a fresh role assignment id.
pub fn role_requests(
    path: &str,
    assignment: &PolicyAssignment,
    role_definition_ids: &[String],
) -> Vec<RoleRequest> {
    let Some(principal_id) = assignment.principal_id() else {
        return Vec::new();
    };
    role_definition_ids
        .iter()
        .map(|role| RoleRequest {
            scope: assignment.scope(),
            role_assignment_id: uuid::Uuid::new_v4().to_string(),
            role_definition_id: short_role_id(role).to_string(),
            principal_id: principal_id.to_string(),
            policy_assignment_id: assignment.id.clone(),
            policy_definition_id: assignment.properties.policy_definition_id.clone(),
            path: path.to_string(),
            display_name: assignment
                .properties
                .display_name
                .clone()
                .unwrap_or_else(|| assignment.name.clone()),
        })
        .collect()
}

fn role_result(request: &RoleRequest, status: PolicyStatus, message: String) -> PolicyResult {
    PolicyResult {
        path: request.path.clone(),
        result_type: ResultType::RoleAssignment,
        operation: Operation::Create,
        display_name: request.display_name.clone(),
        status,
        message,
        policy_definition_id: request.policy_definition_id.clone(),
    }
}

/// Grant the roles required by each created assignment's definition.
///
/// Fetch and grant failures are returned as FAILED results; only batch-level
/// errors are propagated.
pub async fn assign_roles(
    batch: &BatchClient,
    config: &SyncConfig,
    assignments: &[UpsertOutcome],
) -> Result<Vec<PolicyResult>> {
    let identities = identities_to_grant(assignments);
    if identities.is_empty() {
        tracing::debug!("No managed identities need role assignments");
        return Ok(Vec::new());
    }

    let mut definition_ids: Vec<String> = Vec::new();
    for (_, assignment) in &identities {
        let id = &assignment.properties.policy_definition_id;
        if !definition_ids.iter().any(|d| d.eq_ignore_ascii_case(id)) {
            definition_ids.push(id.clone());
        }
    }
    let urls = definition_ids
        .iter()
        .map(|id| batch.resource_url(id, &config.api.policy))
        .collect();
    let responses = batch.get(urls).await?;

    let mut results = Vec::new();
    let mut roles_by_definition: HashMap<String, Vec<String>> = HashMap::new();
    for (id, response) in definition_ids.iter().zip(&responses) {
        match classify_fetch(PolicyKind::Definition, response) {
            FetchOutcome::Found(PolicyObject::Definition(definition)) => {
                let roles = definition.role_definition_ids();
                if roles.is_empty() {
                    tracing::info!(definition_id = %id, "Definition requires no roles");
                }
                roles_by_definition.insert(id.to_ascii_lowercase(), roles);
            }
            FetchOutcome::Found(PolicyObject::Initiative(_)) => {
                tracing::info!(definition_id = %id, "Initiative carries no role definitions");
            }
            outcome => {
                let message = match outcome {
                    FetchOutcome::Failed { code, message } => format!("{code}: {message}"),
                    FetchOutcome::NotFound => format!("definition {id} not found"),
                    FetchOutcome::Found(other) => {
                        format!("{id} is a {}, not a definition", other.kind())
                    }
                };
                tracing::warn!(definition_id = %id, error = %message, "Could not read definition for role assignment");
                for (path, assignment) in identities
                    .iter()
                    .filter(|(_, a)| a.properties.policy_definition_id.eq_ignore_ascii_case(id))
                {
                    results.push(PolicyResult {
                        path: path.clone(),
                        result_type: ResultType::RoleAssignment,
                        operation: Operation::Create,
                        display_name: assignment
                            .properties
                            .display_name
                            .clone()
                            .unwrap_or_else(|| assignment.name.clone()),
                        status: PolicyStatus::Failed,
                        message: message.clone(),
                        policy_definition_id: id.clone(),
                    });
                }
            }
        }
    }

    let requests: Vec<RoleRequest> = identities
        .iter()
        .flat_map(|(path, assignment)| {
            let roles = roles_by_definition
                .get(&assignment.properties.policy_definition_id.to_ascii_lowercase())
                .map(Vec::as_slice)
                .unwrap_or_default();
            role_requests(path, assignment, roles)
        })
        .collect();
    if requests.is_empty() {
        return Ok(results);
    }

    let items = requests
        .iter()
        .map(|r| {
            let url = batch.resource_url(
                &format!(
                    "{}/providers/Microsoft.Authorization/roleAssignments/{}",
                    r.scope, r.role_assignment_id
                ),
                &config.api.role_assignments,
            );
            let body = json!({
                "properties": {
                    "roleDefinitionId": format!(
                        "{}/providers/Microsoft.Authorization/roleDefinitions/{}",
                        r.scope, r.role_definition_id
                    ),
                    "principalId": r.principal_id,
                    "principalType": "ServicePrincipal",
                }
            });
            (url, body)
        })
        .collect();
    let responses = batch.put(items).await?;

    for (request, response) in requests.iter().zip(&responses) {
        if response.http_status_code == CREATED {
            results.push(role_result(
                request,
                PolicyStatus::Succeeded,
                format!("role {} assigned", request.role_definition_id),
            ));
        } else {
            let message = response.error_message().unwrap_or_else(|| {
                format!(
                    "role {} could not be assigned (HTTP {})",
                    request.role_definition_id, response.http_status_code
                )
            });
            results.push(role_result(request, PolicyStatus::Failed, message));
        }
    }

    tracing::info!(
        granted = results.iter().filter(|r| r.status == PolicyStatus::Succeeded).count(),
        failed = results.iter().filter(|r| r.is_failed()).count(),
        "Assigned roles to managed identities"
    );
    Ok(results)
}

//! Delete-and-recreate for definitions whose in-place update was rejected.
//!
//! The remote service refuses some definition changes with `400 Bad Request`
//! (e.g. a rule that now targets another resource type). Such definitions are
//! replaced as a group:
//!
//! 1. fetch the live definitions and every assignment that references them
//! 2. abort unless every live object is valid and every live assignment is
//!    also declared in the repository
//! 3. create `_duplicate` copies of the live definitions and assignments
//! 4. delete the live assignments, then the live definitions
//! 5. create the definitions from the repository, then their assignments
//! 6. delete the duplicates
//!
//! Failures in step 4 or 5 restore the live objects and remove the
//! duplicates. Anything that cannot be cleaned up is reported as
//! [`PolicyStatus::Unresolved`] and left for an operator.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::batch::{BatchClient, BatchResponse};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::model::{
    LocalPolicy, Operation, PolicyKind, PolicyObject, PolicyRequest, PolicyResult, PolicyStatus,
    UpsertOutcome, scope_of,
};
use crate::reconcile::{annotate, upsert_requests};

pub const DUPLICATE_SUFFIX: &str = "_duplicate";

const BAD_REQUEST: u16 = 400;

/// Definition and assignment outcomes after superseded entries were struck.
#[derive(Debug, Default)]
pub struct ForceUpdateOutcome {
    pub definitions: Vec<UpsertOutcome>,
    pub assignments: Vec<UpsertOutcome>,
    /// Objects left behind by a failed cleanup or revert
    pub unresolved: Vec<PolicyResult>,
}

#[derive(Debug, Error)]
enum AbortReason {
    #[error("could not fetch live state: {0}")]
    Fetch(String),
    #[error("live policy {0} is invalid")]
    Invalid(String),
    #[error("live assignments are not declared in the repository: {}", .0.join(", "))]
    Incomplete(Vec<String>),
    #[error("could not create duplicates: {0}")]
    Duplicate(String),
    #[error("could not delete live policies: {0}")]
    Delete(String),
}

enum Halt {
    Abort(AbortReason),
    Fatal(SyncError),
}

impl From<AbortReason> for Halt {
    fn from(reason: AbortReason) -> Self {
        Self::Abort(reason)
    }
}

/// A rejected in-place update: UPDATE answered with 400.
pub fn is_bad_request(outcome: &UpsertOutcome) -> bool {
    outcome.request.operation == Operation::Update
        && outcome.response.http_status_code == BAD_REQUEST
}

/// Copy of `policy` with the duplicate suffix on its id, name and display
/// name, and for assignments on the referenced definition too.
pub fn duplicate_of(policy: &PolicyObject) -> PolicyObject {
    let mut copy = for_put(policy);
    let suffix = |s: &mut String| s.push_str(DUPLICATE_SUFFIX);
    match &mut copy {
        PolicyObject::Definition(d) => {
            suffix(&mut d.id);
            suffix(&mut d.name);
            if let Some(name) = &mut d.properties.display_name {
                suffix(name);
            }
        }
        PolicyObject::Initiative(i) => {
            suffix(&mut i.id);
            suffix(&mut i.name);
            if let Some(name) = &mut i.properties.display_name {
                suffix(name);
            }
        }
        PolicyObject::Assignment(a) => {
            suffix(&mut a.id);
            suffix(&mut a.name);
            suffix(&mut a.properties.policy_definition_id);
            if let Some(name) = &mut a.properties.display_name {
                suffix(name);
            }
        }
    }
    copy
}

/// Body suitable for a PUT: assignment identities keep only their type.
fn for_put(policy: &PolicyObject) -> PolicyObject {
    let mut copy = policy.clone();
    if let PolicyObject::Assignment(a) = &mut copy
        && let Some(identity) = &mut a.identity
    {
        identity.principal_id = None;
        identity.tenant_id = None;
    }
    copy
}

fn key(id: &str) -> String {
    id.to_ascii_lowercase()
}

/// Path of the listing that returns every assignment of a definition.
fn assignments_of_path(definition_id: &str) -> String {
    let filter: String = url::form_urlencoded::byte_serialize(
        format!("policyDefinitionId eq '{definition_id}'").as_bytes(),
    )
    .collect();
    format!(
        "{}/providers/Microsoft.Authorization/policyAssignments?$filter={filter}",
        scope_of(definition_id)
    )
}

struct Failure {
    id: String,
    message: String,
}

fn describe(failures: &[Failure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.id, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

fn failures_in<'a>(
    ids: impl IntoIterator<Item = &'a str>,
    responses: &[BatchResponse],
) -> Vec<Failure> {
    ids.into_iter()
        .zip(responses)
        .filter(|(_, r)| !r.is_success() || r.error().is_some())
        .map(|(id, r)| Failure {
            id: id.to_string(),
            message: r
                .error_message()
                .unwrap_or_else(|| format!("HTTP {}", r.http_status_code)),
        })
        .collect()
}

/// Everything one replacement works on.
struct Replacement {
    definitions: Vec<PolicyRequest>,
    assignments: Vec<PolicyRequest>,
    live_definitions: Vec<PolicyObject>,
    live_assignments: Vec<PolicyObject>,
    duplicate_definitions: Vec<PolicyObject>,
    duplicate_assignments: Vec<PolicyObject>,
    paths: HashMap<String, String>,
}

impl Replacement {
    fn path_of(&self, id: &str) -> String {
        let id = key(id);
        let original = id.strip_suffix(DUPLICATE_SUFFIX).unwrap_or(&id);
        self.paths
            .get(original)
            .cloned()
            .unwrap_or_else(|| "-".to_string())
    }
}

pub struct ForceUpdater<'a> {
    batch: &'a BatchClient,
    config: &'a SyncConfig,
}

impl<'a> ForceUpdater<'a> {
    pub fn new(batch: &'a BatchClient, config: &'a SyncConfig) -> Self {
        Self { batch, config }
    }

    /// Replace every definition whose UPDATE was rejected.
    ///
    /// Returns the outcomes with superseded entries removed and the
    /// FORCE_UPDATE / FORCE_CREATE outcomes appended. When the replacement is
    /// abandoned before anything was deleted, the inputs come back unchanged.
    /// A failure while recreating from the repository is reverted and then
    /// returned as [`SyncError::ForceUpdateFailed`].
    pub async fn run(
        &self,
        definitions: Vec<UpsertOutcome>,
        assignments: Vec<UpsertOutcome>,
        local_assignments: &[LocalPolicy],
    ) -> Result<ForceUpdateOutcome> {
        let rejected: Vec<PolicyRequest> = definitions
            .iter()
            .filter(|o| is_bad_request(o))
            .map(|o| o.request.clone())
            .collect();
        if rejected.is_empty() {
            return Ok(ForceUpdateOutcome {
                definitions,
                assignments,
                unresolved: Vec::new(),
            });
        }

        tracing::info!(count = rejected.len(), "Force updating rejected definitions");
        let affected: HashSet<String> = rejected.iter().map(|r| key(r.policy.id())).collect();
        let mut unresolved = Vec::new();

        match self
            .replace(rejected, local_assignments, &mut unresolved)
            .await
        {
            Ok((new_definitions, new_assignments)) => {
                let definitions = definitions
                    .into_iter()
                    .filter(|o| !is_bad_request(o))
                    .chain(new_definitions)
                    .collect();
                let assignments = assignments
                    .into_iter()
                    .filter(|o| !affected.contains(&key(o.request.policy.policy_definition_id())))
                    .chain(new_assignments)
                    .collect();
                Ok(ForceUpdateOutcome {
                    definitions,
                    assignments,
                    unresolved,
                })
            }
            Err(Halt::Abort(reason)) => {
                tracing::warn!(reason = %reason, "Force update abandoned");
                Ok(ForceUpdateOutcome {
                    definitions,
                    assignments,
                    unresolved,
                })
            }
            Err(Halt::Fatal(err)) => Err(err),
        }
    }

    async fn replace(
        &self,
        rejected: Vec<PolicyRequest>,
        local_assignments: &[LocalPolicy],
        unresolved: &mut Vec<PolicyResult>,
    ) -> std::result::Result<(Vec<UpsertOutcome>, Vec<UpsertOutcome>), Halt> {
        let definition_ids: Vec<String> = rejected.iter().map(|r| r.policy.id().to_string()).collect();
        let affected: HashSet<String> = definition_ids.iter().map(|id| key(id)).collect();

        let mut assignments = Vec::new();
        for local in local_assignments {
            if !affected.contains(&key(local.policy.policy_definition_id())) {
                continue;
            }
            let policy = annotate(&local.policy, &local.path, &self.config.context)
                .map_err(Halt::Fatal)?;
            assignments.push(PolicyRequest {
                path: local.path.clone(),
                operation: Operation::ForceCreate,
                policy,
            });
        }

        let (live_definitions, live_assignments) = self.fetch_live(&definition_ids).await?;
        check_coverage(&live_assignments, &assignments)?;

        let paths: HashMap<String, String> = rejected
            .iter()
            .chain(&assignments)
            .map(|r| (key(r.policy.id()), r.path.clone()))
            .collect();
        let plan = Replacement {
            definitions: rejected
                .into_iter()
                .map(|r| PolicyRequest {
                    operation: Operation::ForceUpdate,
                    ..r
                })
                .collect(),
            assignments,
            duplicate_definitions: live_definitions.iter().map(duplicate_of).collect(),
            duplicate_assignments: live_assignments.iter().map(duplicate_of).collect(),
            live_definitions,
            live_assignments,
            paths,
        };

        self.create_duplicates(&plan, unresolved).await?;

        if let Err((reason, removed)) = self.delete_live(&plan).await {
            self.revert(&plan, &[], &removed, unresolved).await;
            return Err(reason.into());
        }

        let created = self.create_from_code(&plan).await;
        let (definitions, assignments) = match created {
            Ok(outcomes) => outcomes,
            Err((reason, created_ids)) => {
                let removed: Vec<PolicyObject> = plan
                    .live_assignments
                    .iter()
                    .chain(&plan.live_definitions)
                    .cloned()
                    .collect();
                self.revert(&plan, &created_ids, &removed, unresolved).await;
                let mut message = reason;
                if !unresolved.is_empty() {
                    message.push_str(&format!(
                        "; revert left {} object(s) unresolved",
                        unresolved.len()
                    ));
                }
                return Err(Halt::Fatal(SyncError::ForceUpdateFailed(message)));
            }
        };

        self.delete_duplicates(&plan, unresolved).await;

        tracing::info!(
            definitions = definitions.len(),
            assignments = assignments.len(),
            "Force update completed"
        );
        Ok((definitions, assignments))
    }

    async fn fetch_live(
        &self,
        definition_ids: &[String],
    ) -> std::result::Result<(Vec<PolicyObject>, Vec<PolicyObject>), AbortReason> {
        let api = &self.config.api.policy;
        let urls = definition_ids
            .iter()
            .map(|id| self.batch.resource_url(id, api))
            .collect();
        let responses = self
            .batch
            .get(urls)
            .await
            .map_err(|e| AbortReason::Fetch(e.to_string()))?;

        let mut definitions = Vec::with_capacity(responses.len());
        for (id, response) in definition_ids.iter().zip(&responses) {
            if !response.is_success() {
                return Err(AbortReason::Fetch(format!(
                    "{id}: {}",
                    response.error_message().unwrap_or_default()
                )));
            }
            definitions.push(parse_live(&response.content, PolicyKind::Definition, id)?);
        }

        let list_urls = definition_ids
            .iter()
            .map(|id| self.batch.resource_url(&assignments_of_path(id), api))
            .collect();
        let lists = self
            .batch
            .get(list_urls)
            .await
            .map_err(|e| AbortReason::Fetch(e.to_string()))?;

        let mut seen = HashSet::new();
        let mut assignments = Vec::new();
        for (id, list) in definition_ids.iter().zip(&lists) {
            if !list.is_success() {
                return Err(AbortReason::Fetch(format!(
                    "assignments of {id}: {}",
                    list.error_message().unwrap_or_default()
                )));
            }
            let Some(values) = list.content.get("value").and_then(|v| v.as_array()) else {
                return Err(AbortReason::Fetch(format!("assignments of {id}: missing value")));
            };
            for value in values {
                let assignment = parse_live(value, PolicyKind::Assignment, id)?;
                if seen.insert(key(assignment.id())) {
                    assignments.push(assignment);
                }
            }
        }

        tracing::debug!(
            definitions = definitions.len(),
            assignments = assignments.len(),
            "Fetched live state for force update"
        );
        Ok((definitions, assignments))
    }

    async fn put_all(&self, objects: &[PolicyObject]) -> Vec<Failure> {
        if objects.is_empty() {
            return Vec::new();
        }
        let all_failed = |message: String| -> Vec<Failure> {
            objects
                .iter()
                .map(|o| Failure {
                    id: o.id().to_string(),
                    message: message.clone(),
                })
                .collect()
        };

        let mut items = Vec::with_capacity(objects.len());
        for object in objects {
            match serde_json::to_value(for_put(object)) {
                Ok(body) => items.push((
                    self.batch.resource_url(object.id(), &self.config.api.policy),
                    body,
                )),
                Err(e) => return all_failed(e.to_string()),
            }
        }
        match self.batch.put(items).await {
            Ok(responses) => failures_in(objects.iter().map(PolicyObject::id), &responses),
            Err(e) => all_failed(e.to_string()),
        }
    }

    async fn delete_all(&self, objects: &[PolicyObject]) -> Vec<Failure> {
        if objects.is_empty() {
            return Vec::new();
        }
        let urls = objects
            .iter()
            .map(|o| self.batch.resource_url(o.id(), &self.config.api.policy))
            .collect();
        match self.batch.delete(urls).await {
            Ok(responses) => failures_in(objects.iter().map(PolicyObject::id), &responses),
            Err(e) => objects
                .iter()
                .map(|o| Failure {
                    id: o.id().to_string(),
                    message: e.to_string(),
                })
                .collect(),
        }
    }

    async fn create_duplicates(
        &self,
        plan: &Replacement,
        unresolved: &mut Vec<PolicyResult>,
    ) -> std::result::Result<(), AbortReason> {
        let mut failures = self.put_all(&plan.duplicate_definitions).await;
        if failures.is_empty() {
            failures = self.put_all(&plan.duplicate_assignments).await;
        }
        if failures.is_empty() {
            return Ok(());
        }
        self.delete_duplicates(plan, unresolved).await;
        Err(AbortReason::Duplicate(describe(&failures)))
    }

    /// On failure, returns the reason and the live objects that were
    /// removed before it.
    async fn delete_live(
        &self,
        plan: &Replacement,
    ) -> std::result::Result<(), (AbortReason, Vec<PolicyObject>)> {
        // A definition cannot be deleted while an assignment still references it.
        let failures = self.delete_all(&plan.live_assignments).await;
        let mut removed = without_failures(&plan.live_assignments, &failures);
        if !failures.is_empty() {
            return Err((AbortReason::Delete(describe(&failures)), removed));
        }
        let failures = self.delete_all(&plan.live_definitions).await;
        if !failures.is_empty() {
            removed.extend(without_failures(&plan.live_definitions, &failures));
            return Err((AbortReason::Delete(describe(&failures)), removed));
        }
        Ok(())
    }

    /// Create definitions then assignments from the repository. On failure,
    /// returns the reason and the objects that were created before it.
    async fn create_from_code(
        &self,
        plan: &Replacement,
    ) -> std::result::Result<(Vec<UpsertOutcome>, Vec<UpsertOutcome>), (String, Vec<PolicyObject>)>
    {
        let api = &self.config.api.policy;
        let succeeded = |outcomes: &[UpsertOutcome]| -> Vec<PolicyObject> {
            outcomes
                .iter()
                .filter(|o| o.response.is_success() && o.response.error().is_none())
                .map(|o| o.request.policy.clone())
                .collect()
        };
        let failed = |outcomes: &[UpsertOutcome]| -> Vec<Failure> {
            outcomes
                .iter()
                .filter(|o| !o.response.is_success() || o.response.error().is_some())
                .map(|o| Failure {
                    id: o.request.policy.id().to_string(),
                    message: o.error_message().unwrap_or_else(|| {
                        format!("HTTP {}", o.response.http_status_code)
                    }),
                })
                .collect()
        };

        let definitions = upsert_requests(self.batch, api, plan.definitions.clone())
            .await
            .map_err(|e| (e.to_string(), Vec::new()))?;
        let mut created = succeeded(&definitions);
        let failures = failed(&definitions);
        if !failures.is_empty() {
            return Err((describe(&failures), created));
        }

        let assignments = match upsert_requests(self.batch, api, plan.assignments.clone()).await {
            Ok(outcomes) => outcomes,
            Err(e) => return Err((e.to_string(), created)),
        };
        let failures = failed(&assignments);
        if !failures.is_empty() {
            // Assignments go first when cleaning up.
            let mut with_assignments = succeeded(&assignments);
            with_assignments.append(&mut created);
            return Err((describe(&failures), with_assignments));
        }

        Ok((definitions, assignments))
    }

    /// Undo a partial replacement: remove what was created from the
    /// repository, put back the live objects that were removed, drop the
    /// duplicates.
    async fn revert(
        &self,
        plan: &Replacement,
        created: &[PolicyObject],
        removed: &[PolicyObject],
        unresolved: &mut Vec<PolicyResult>,
    ) {
        tracing::warn!("Reverting force update");

        let (created_assignments, created_definitions): (Vec<PolicyObject>, Vec<PolicyObject>) =
            created
                .iter()
                .cloned()
                .partition(|o| o.kind() == PolicyKind::Assignment);
        for objects in [&created_assignments, &created_definitions] {
            let failures = self.delete_all(objects).await;
            self.record(plan, objects, &failures, Operation::Delete, unresolved);
        }

        // Definitions must exist before the assignments that reference them.
        let (removed_assignments, removed_definitions): (Vec<PolicyObject>, Vec<PolicyObject>) =
            removed
                .iter()
                .cloned()
                .partition(|o| o.kind() == PolicyKind::Assignment);
        for live in [&removed_definitions, &removed_assignments] {
            let failures = self.put_all(live).await;
            self.record(plan, live, &failures, Operation::Create, unresolved);
        }

        self.delete_duplicates(plan, unresolved).await;
    }

    async fn delete_duplicates(&self, plan: &Replacement, unresolved: &mut Vec<PolicyResult>) {
        for duplicates in [&plan.duplicate_assignments, &plan.duplicate_definitions] {
            let failures = self.delete_all(duplicates).await;
            self.record(plan, duplicates, &failures, Operation::Delete, unresolved);
        }
    }

    fn record(
        &self,
        plan: &Replacement,
        objects: &[PolicyObject],
        failures: &[Failure],
        operation: Operation,
        unresolved: &mut Vec<PolicyResult>,
    ) {
        for failure in failures {
            let Some(policy) = objects.iter().find(|o| o.id() == failure.id) else {
                continue;
            };
            tracing::error!(
                id = %failure.id,
                operation = %operation,
                error = %failure.message,
                "Force update left remote state unresolved"
            );
            unresolved.push(PolicyResult::for_policy(
                &plan.path_of(&failure.id),
                policy,
                operation,
                PolicyStatus::Unresolved,
                format!("{}: {}", failure.id, failure.message),
            ));
        }
    }
}

fn without_failures(objects: &[PolicyObject], failures: &[Failure]) -> Vec<PolicyObject> {
    objects
        .iter()
        .filter(|o| !failures.iter().any(|f| f.id == o.id()))
        .cloned()
        .collect()
}

fn parse_live(
    value: &serde_json::Value,
    expected: PolicyKind,
    context: &str,
) -> std::result::Result<PolicyObject, AbortReason> {
    let policy: PolicyObject = serde_json::from_value(value.clone())
        .map_err(|e| AbortReason::Invalid(format!("{context} ({e})")))?;
    if policy.kind() != expected || !policy.is_valid() {
        return Err(AbortReason::Invalid(format!(
            "{} (referenced from {context})",
            policy.id()
        )));
    }
    Ok(policy)
}

/// Every live assignment must be declared locally, or the replacement would
/// silently drop it.
fn check_coverage(
    live_assignments: &[PolicyObject],
    local: &[PolicyRequest],
) -> std::result::Result<(), AbortReason> {
    let declared: HashSet<String> = local.iter().map(|r| key(r.policy.id())).collect();
    let missing: Vec<String> = live_assignments
        .iter()
        .filter(|a| !declared.contains(&key(a.id())))
        .map(|a| a.id().to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(AbortReason::Incomplete(missing))
    }
}

//! Drift detection and batched upserts.
//!
//! Every local object is looked up remotely in one batch, compared against
//! the digest stored in its tracking block, and turned into a CREATE, UPDATE
//! or NONE request. Mutating requests are upserted per kind, definitions
//! first, so that assignments never reference a missing definition.

use crate::batch::{BatchClient, BatchResponse};
use crate::config::{InvocationContext, SyncConfig, SyncMode};
use crate::error::Result;
use crate::hash::content_hash;
use crate::model::{
    FetchOutcome, LocalPolicy, Operation, PolicyDetails, PolicyKind, PolicyObject, PolicyRequest,
    PolicyResult, PolicyStatus, TrackingMetadata, UpsertOutcome,
};

/// Classify the batch response of a GET for an object of `kind`.
pub fn classify_fetch(kind: PolicyKind, response: &BatchResponse) -> FetchOutcome {
    if response.is_success() {
        return match serde_json::from_value::<PolicyObject>(response.content.clone()) {
            Ok(policy) => FetchOutcome::Found(policy),
            Err(e) => FetchOutcome::Failed {
                code: "InvalidResponse".into(),
                message: format!("unreadable {kind}: {e}"),
            },
        };
    }
    match response.error_code() {
        Some(code) if code == kind.not_found_code() => FetchOutcome::NotFound,
        code => FetchOutcome::Failed {
            code: code.unwrap_or("Unknown").to_string(),
            message: response
                .error_message()
                .unwrap_or_else(|| format!("HTTP {}", response.http_status_code)),
        },
    }
}

/// Fetch the remote counterpart of every local object in a single batch.
pub async fn fetch_details<'a>(
    batch: &BatchClient,
    config: &SyncConfig,
    locals: impl IntoIterator<Item = &'a LocalPolicy>,
) -> Result<Vec<PolicyDetails>> {
    let locals: Vec<&LocalPolicy> = locals.into_iter().collect();
    let urls = locals
        .iter()
        .map(|local| batch.resource_url(local.policy.id(), &config.api.policy))
        .collect();
    let responses = batch.get(urls).await?;

    Ok(locals
        .into_iter()
        .zip(responses)
        .map(|(local, response)| PolicyDetails {
            path: local.path.clone(),
            policy_in_service: classify_fetch(local.policy.kind(), &response),
            policy_in_code: local.policy.clone(),
        })
        .collect())
}

/// Decide what to do with one object given its digest and the stored one.
pub fn decide(mode: SyncMode, current_hash: &str, remote: &FetchOutcome) -> Option<Operation> {
    match remote {
        FetchOutcome::NotFound => Some(Operation::Create),
        FetchOutcome::Failed { .. } => None,
        FetchOutcome::Found(policy) => {
            let azure_hash = policy.tracking().map(|t| t.digest);
            match azure_hash {
                _ if mode == SyncMode::Complete => Some(Operation::Update),
                None => Some(Operation::Update),
                Some(hash) if hash != current_hash => Some(Operation::Update),
                Some(_) => Some(Operation::None),
            }
        }
    }
}

/// Copy of `policy` carrying a fresh tracking block.
pub fn annotate(
    policy: &PolicyObject,
    path: &str,
    context: &InvocationContext,
) -> Result<PolicyObject> {
    let digest = content_hash(policy)?;
    let mut annotated = policy.without_tracking();
    annotated.set_tracking(&TrackingMetadata {
        digest,
        repo_name: context.repo_name.clone(),
        commit_sha: context.commit_sha.clone(),
        run_url: context.run_url.clone(),
        filepath: path.to_string(),
    })?;
    Ok(annotated)
}

#[derive(Debug, Default)]
pub struct Plan {
    /// One request per object whose remote state could be read
    pub requests: Vec<PolicyRequest>,
    /// Objects whose lookup failed for a reason other than "not found"
    pub fetch_failures: Vec<PolicyResult>,
}

impl Plan {
    pub fn mutations(&self) -> impl Iterator<Item = &PolicyRequest> {
        self.requests
            .iter()
            .filter(|r| matches!(r.operation, Operation::Create | Operation::Update))
    }
}

pub fn plan(details: Vec<PolicyDetails>, config: &SyncConfig) -> Result<Plan> {
    let mut plan = Plan::default();

    for detail in details {
        let current_hash = content_hash(&detail.policy_in_code)?;
        let Some(operation) = decide(config.mode, &current_hash, &detail.policy_in_service) else {
            if let FetchOutcome::Failed { code, message } = &detail.policy_in_service {
                tracing::warn!(path = %detail.path, code = %code, "Could not read remote policy");
                plan.fetch_failures.push(PolicyResult::for_policy(
                    &detail.path,
                    &detail.policy_in_code,
                    Operation::None,
                    PolicyStatus::Failed,
                    format!("{code}: {message}"),
                ));
            }
            continue;
        };

        let policy = if operation == Operation::None {
            detail.policy_in_code
        } else {
            annotate(&detail.policy_in_code, &detail.path, &config.context)?
        };
        plan.requests.push(PolicyRequest {
            path: detail.path,
            operation,
            policy,
        });
    }

    tracing::info!(
        creates = plan.requests.iter().filter(|r| r.operation == Operation::Create).count(),
        updates = plan.requests.iter().filter(|r| r.operation == Operation::Update).count(),
        unchanged = plan.requests.iter().filter(|r| r.operation == Operation::None).count(),
        fetch_failures = plan.fetch_failures.len(),
        "Planned policy operations"
    );
    Ok(plan)
}

/// Upsert requests in one batch, pairing each with its response.
pub async fn upsert_requests(
    batch: &BatchClient,
    api_version: &str,
    requests: Vec<PolicyRequest>,
) -> Result<Vec<UpsertOutcome>> {
    let mut items = Vec::with_capacity(requests.len());
    for request in &requests {
        items.push((
            batch.resource_url(request.policy.id(), api_version),
            serde_json::to_value(&request.policy)?,
        ));
    }
    let responses = batch.put(items).await?;

    Ok(requests
        .into_iter()
        .zip(responses)
        .map(|(request, response)| UpsertOutcome { request, response })
        .collect())
}

/// Upsert outcomes grouped by kind, each group in request order.
#[derive(Debug, Default)]
pub struct UpsertOutcomes {
    pub definitions: Vec<UpsertOutcome>,
    pub initiatives: Vec<UpsertOutcome>,
    pub assignments: Vec<UpsertOutcome>,
}

/// Upsert every CREATE/UPDATE request: definitions, then initiatives, then assignments.
pub async fn upsert(
    batch: &BatchClient,
    config: &SyncConfig,
    plan: &Plan,
) -> Result<UpsertOutcomes> {
    let of_kind = |kind: PolicyKind| -> Vec<PolicyRequest> {
        plan.mutations()
            .filter(|r| r.policy.kind() == kind)
            .cloned()
            .collect()
    };
    let api = &config.api.policy;

    let outcomes = UpsertOutcomes {
        definitions: upsert_requests(batch, api, of_kind(PolicyKind::Definition)).await?,
        initiatives: upsert_requests(batch, api, of_kind(PolicyKind::Initiative)).await?,
        assignments: upsert_requests(batch, api, of_kind(PolicyKind::Assignment)).await?,
    };

    tracing::info!(
        definitions = outcomes.definitions.len(),
        initiatives = outcomes.initiatives.len(),
        assignments = outcomes.assignments.len(),
        "Upserted policies"
    );
    Ok(outcomes)
}

/// One result per outcome; success means the response carries no `error`.
pub fn results_for(outcomes: &[UpsertOutcome]) -> Vec<PolicyResult> {
    outcomes
        .iter()
        .map(|outcome| {
            let request = &outcome.request;
            let (status, message) = match outcome.error_message() {
                None => (
                    PolicyStatus::Succeeded,
                    format!("{} {} succeeded", request.policy.kind(), request.operation),
                ),
                Some(message) => (PolicyStatus::Failed, message),
            };
            PolicyResult::for_policy(
                &request.path,
                &request.policy,
                request.operation,
                status,
                message,
            )
        })
        .collect()
}

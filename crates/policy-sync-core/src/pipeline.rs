//! The reconciliation run: discovery, drift detection, upserts, force update
//! and role grants, strictly one phase after another.

use crate::batch::BatchClient;
use crate::config::SyncConfig;
use crate::discovery::discover;
use crate::error::Result;
use crate::force_update::ForceUpdater;
use crate::model::{Operation, PolicyResult, PolicyStatus};
use crate::reconcile::{Plan, UpsertOutcomes, fetch_details, plan, results_for, upsert};
use crate::roles::assign_roles;

/// Everything a run produced, in phase order.
#[derive(Debug, Default)]
pub struct RunReport {
    pub results: Vec<PolicyResult>,
    /// Objects already in sync
    pub unchanged: usize,
}

impl RunReport {
    pub fn count(&self, status: PolicyStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn failed(&self) -> usize {
        self.count(PolicyStatus::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

/// Discover local policies and decide what each needs, without mutating anything.
pub async fn preview(config: &SyncConfig, batch: &BatchClient) -> Result<Plan> {
    let discovered = discover(config)?;
    if discovered.is_empty() {
        return Ok(Plan::default());
    }
    let details = fetch_details(batch, config, discovered.all()).await?;
    plan(details, config)
}

pub async fn run(config: &SyncConfig, batch: &BatchClient) -> Result<RunReport> {
    let discovered = discover(config)?;
    if discovered.is_empty() {
        tracing::warn!(root = %config.root.display(), "No policies matched the configured paths");
        return Ok(RunReport::default());
    }

    let details = fetch_details(batch, config, discovered.all()).await?;
    let plan = plan(details, config)?;
    let unchanged = plan
        .requests
        .iter()
        .filter(|r| r.operation == Operation::None)
        .count();

    let UpsertOutcomes {
        definitions,
        initiatives,
        assignments,
    } = upsert(batch, config, &plan).await?;

    let mut unresolved = Vec::new();
    let (definitions, assignments) = if config.force_update {
        let outcome = ForceUpdater::new(batch, config)
            .run(definitions, assignments, &discovered.assignments)
            .await?;
        unresolved = outcome.unresolved;
        (outcome.definitions, outcome.assignments)
    } else {
        (definitions, assignments)
    };

    let mut results = results_for(&definitions);
    results.extend(results_for(&initiatives));
    results.extend(results_for(&assignments));
    results.extend(plan.fetch_failures);
    results.extend(unresolved);
    results.extend(assign_roles(batch, config, &assignments).await?);

    let report = RunReport { results, unchanged };
    tracing::info!(
        succeeded = report.count(PolicyStatus::Succeeded),
        failed = report.failed(),
        unresolved = report.count(PolicyStatus::Unresolved),
        unchanged = report.unchanged,
        "Reconciliation finished"
    );
    Ok(report)
}

use anyhow::{Context, Result};
use policy_sync_core::{BatchClient, RunReport, SyncConfig};

use crate::output::print_report;

pub async fn sync(config: &SyncConfig, batch: &BatchClient) -> Result<RunReport> {
    tracing::info!(
        root = %config.root.display(),
        mode = ?config.mode,
        force_update = config.force_update,
        "Starting policy sync"
    );
    let report = policy_sync_core::run(config, batch)
        .await
        .context("Policy sync aborted")?;
    print_report(&report);
    Ok(report)
}

use anyhow::{Context, Result};
use policy_sync_core::{BatchClient, SyncConfig};

use crate::output::print_plan;

pub async fn plan(config: &SyncConfig, batch: &BatchClient) -> Result<()> {
    let plan = policy_sync_core::preview(config, batch)
        .await
        .context("Could not compute plan")?;
    print_plan(&plan);
    Ok(())
}

use std::sync::Arc;

use anyhow::{Context, Result};
use policy_sync_core::{
    AzureCliCredential, BatchClient, CredentialProvider, RestClient, StaticCredential, SyncConfig,
};

use crate::cli::RunArgs;
use crate::config::FileConfig;

const DEFAULT_MANAGEMENT_URL: &str = "https://management.azure.com";

/// A static token when one was supplied, the Azure CLI session otherwise.
pub fn credential_provider(file: &FileConfig, args: &RunArgs) -> Box<dyn CredentialProvider> {
    let management_url = args
        .management_url
        .clone()
        .or_else(|| file.management_url.clone());
    match &args.token {
        Some(token) if !token.is_empty() => Box::new(StaticCredential::new(
            token.clone(),
            management_url.unwrap_or_else(|| DEFAULT_MANAGEMENT_URL.to_string()),
        )),
        _ => Box::new(AzureCliCredential { management_url }),
    }
}

/// Authenticate and build the batch client for this run.
pub async fn connect(file: &FileConfig, args: &RunArgs, config: &SyncConfig) -> Result<BatchClient> {
    let access = credential_provider(file, args)
        .access_token()
        .await
        .context("Failed to acquire an access token")?;
    tracing::debug!(management_url = %access.management_url, "Authenticated");

    let transport = RestClient::new(&access, config.retry.clone());
    Ok(BatchClient::new(
        Arc::new(transport),
        &access.management_url,
        config.batch.clone(),
        config.api.batch.clone(),
    ))
}

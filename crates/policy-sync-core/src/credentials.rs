//! Access token acquisition.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::error::{Result, SyncError};

/// Bearer token plus the management endpoint it is valid for.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    /// Base URL without a trailing slash, e.g. `https://management.azure.com`
    pub management_url: String,
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self) -> Result<AccessToken>;
}

/// A token handed in directly (environment, CI secret, tests).
pub struct StaticCredential {
    token: String,
    management_url: String,
}

impl StaticCredential {
    pub fn new(token: impl Into<String>, management_url: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            management_url: management_url.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn access_token(&self) -> Result<AccessToken> {
        if self.token.is_empty() {
            return Err(SyncError::credential("empty access token"));
        }
        Ok(AccessToken {
            token: self.token.clone(),
            management_url: self.management_url.trim_end_matches('/').to_string(),
        })
    }
}

/// Token from the logged-in Azure CLI session.
#[derive(Default)]
pub struct AzureCliCredential {
    /// Overrides the endpoint reported by `az cloud show`
    pub management_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    access_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliCloud {
    endpoints: CliEndpoints,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliEndpoints {
    resource_manager: String,
}

async fn run_az(args: &[&str]) -> Result<Vec<u8>> {
    let output = Command::new("az")
        .args(args)
        .output()
        .await
        .map_err(|e| SyncError::credential(format!("failed to run az: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SyncError::credential(format!(
            "az {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(output.stdout)
}

#[async_trait]
impl CredentialProvider for AzureCliCredential {
    async fn access_token(&self) -> Result<AccessToken> {
        let management_url = match &self.management_url {
            Some(url) => url.clone(),
            None => {
                let raw = run_az(&["cloud", "show", "-o", "json"]).await?;
                let cloud: CliCloud = serde_json::from_slice(&raw)
                    .map_err(|e| SyncError::credential(format!("unreadable az cloud output: {e}")))?;
                cloud.endpoints.resource_manager
            }
        };
        let management_url = management_url.trim_end_matches('/').to_string();

        let resource = format!("{management_url}/");
        let raw = run_az(&[
            "account",
            "get-access-token",
            "--resource",
            &resource,
            "-o",
            "json",
        ])
        .await?;
        let token: CliToken = serde_json::from_slice(&raw)
            .map_err(|e| SyncError::credential(format!("unreadable az token output: {e}")))?;

        tracing::debug!(management_url = %management_url, "Acquired access token from Azure CLI");
        Ok(AccessToken {
            token: token.access_token,
            management_url,
        })
    }
}

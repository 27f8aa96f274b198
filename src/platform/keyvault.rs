//! Azure Key Vault secrets via the instance's managed identity

use super::SecretStore;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const VAULT_RESOURCE: &str = "https://vault.azure.net";
const SECRETS_API_VERSION: &str = "2016-10-01";

#[derive(Debug, Deserialize)]
struct AccessToken {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SecretBundle {
    #[serde(default)]
    value: String,
}

/// Reads secrets from `https://<vault>.vault.azure.net`.
///
/// A token is requested from the instance metadata service for every
/// lookup; a pass reads at most three secrets.
pub struct KeyVault {
    agent: ureq::Agent,
    token_url: String,
    vault_suffix: String,
}

impl KeyVault {
    pub fn new() -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(15)))
            .build()
            .into();
        Self {
            agent,
            token_url: IMDS_TOKEN_URL.to_string(),
            vault_suffix: "vault.azure.net".to_string(),
        }
    }

    fn secret_url(&self, vault: &str, key: &str) -> String {
        format!(
            "https://{vault}.{}/secrets/{key}?api-version={SECRETS_API_VERSION}",
            self.vault_suffix
        )
    }

    fn access_token(&self) -> Result<String> {
        let token: AccessToken = self
            .agent
            .get(&self.token_url)
            .query("api-version", IMDS_API_VERSION)
            .query("resource", VAULT_RESOURCE)
            .header("Metadata", "true")
            .call()
            .context("Failed to fetch managed identity access token")?
            .body_mut()
            .read_json()
            .context("Invalid access token response")?;
        Ok(token.access_token)
    }
}

impl Default for KeyVault {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for KeyVault {
    fn get_secret(&self, vault: &str, key: &str) -> Result<String> {
        log::debug!("Looking up secret {key} in vault {vault}");
        let token = self.access_token()?;

        let bundle: SecretBundle = self
            .agent
            .get(&self.secret_url(vault, key))
            .header("Authorization", &format!("Bearer {token}"))
            .call()
            .with_context(|| format!("Failed to fetch secret {key} from {vault}"))?
            .body_mut()
            .read_json()
            .context("Invalid secret response")?;

        Ok(bundle.value.trim().to_string())
    }
}

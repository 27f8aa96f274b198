//! Credentials for one pass
//!
//! Secrets are fetched once, before the first step, and live only in memory.
//! [`Secret`] never prints or serializes its value.

use crate::config::NodeConfig;
use crate::platform::SecretStore;
use serde::{Serialize, Serializer};
use std::fmt;

pub const REDACTED: &str = "********";

/// A string that must not reach logs or disk
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The plaintext, for handing to a child process
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({REDACTED})")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

/// Secrets needed by the pipelines
#[derive(Debug, Clone)]
pub struct Credentials {
    pub admin_name: Secret,
    pub admin_password: Secret,
    pub cert_password: Secret,
}

impl Credentials {
    /// Resolve every secret up front.
    ///
    /// With a vault configured, each secret comes from the vault and an
    /// empty value is a configuration error naming the vault and key.
    /// Without one, the inline config values are used.
    pub fn resolve(config: &NodeConfig, store: &dyn SecretStore) -> convergence::Result<Self> {
        let kv = &config.keyvault;

        let Some(vault) = kv.vault_name.as_deref() else {
            log::debug!("No key vault configured, using inline credentials");
            return Ok(Self {
                admin_name: inline(config.ad.admin_name.as_deref(), "ad.admin_name")?,
                admin_password: inline(config.ad.admin_password.as_deref(), "ad.admin_password")?,
                cert_password: Secret::new(config.cert.password.clone().unwrap_or_default()),
            });
        };

        let admin_name = fetch(store, vault, kv.admin_name_key.as_deref(), "admin_name_key")?;
        let admin_password = fetch(
            store,
            vault,
            kv.admin_password_key.as_deref(),
            "admin_password_key",
        )?;
        let cert_password = match kv.cert_password_key.as_deref() {
            Some(key) => fetch(store, vault, Some(key), "cert_password_key")?,
            None => Secret::new(config.cert.password.clone().unwrap_or_default()),
        };

        log::info!("Fetched credentials from key vault {vault}");
        Ok(Self {
            admin_name,
            admin_password,
            cert_password,
        })
    }

    /// `DOMAIN\user` form of the admin account
    pub fn domain_user(&self, domain: &str) -> String {
        format!("{}\\{}", domain, self.admin_name.expose())
    }
}

fn inline(value: Option<&str>, field: &str) -> convergence::Result<Secret> {
    match value {
        Some(v) if !v.is_empty() => Ok(Secret::new(v)),
        _ => Err(convergence::Error::Configuration {
            message: format!("{field} is not set and no key vault is configured"),
        }),
    }
}

fn fetch(
    store: &dyn SecretStore,
    vault: &str,
    key: Option<&str>,
    field: &str,
) -> convergence::Result<Secret> {
    let key = key.ok_or_else(|| convergence::Error::Configuration {
        message: format!("keyvault.{field} is not set"),
    })?;

    let value = store
        .get_secret(vault, key)
        .map_err(|e| convergence::Error::Configuration {
            message: format!("failed to read secret from {vault} with key {key}: {e:#}"),
        })?;

    let value = value.trim();
    if value.is_empty() {
        return Err(convergence::Error::Configuration {
            message: format!("secret not set in {vault} with key {key}"),
        });
    }
    Ok(Secret::new(value))
}

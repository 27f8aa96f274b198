use super::{HeadNode, HeadNodeLocator};
use crate::config::HeadNodeConfig;
use crate::runner::Invocation;
use anyhow::{Context, Result};
use std::time::Duration;

/// Finds the head node from config or by running a discovery command.
///
/// The command is invoked as `<command> <cluster_uid> <role_tag> <recipe_tag>`
/// and must print `{"hostname": .., "ip_address": .., "fqdn": ..}`.
#[derive(Debug, Default)]
pub struct CommandLocator;

impl HeadNodeLocator for CommandLocator {
    fn locate(&self, config: &HeadNodeConfig) -> Result<HeadNode> {
        if let Some(hostname) = &config.hostname {
            return Ok(HeadNode {
                hostname: hostname.clone(),
                ip_address: config.ip_address.clone(),
                fqdn: None,
            });
        }

        let command = config
            .discovery_command
            .as_deref()
            .context("head_node.hostname is not set and no discovery command is configured")?;
        let cluster_uid = config
            .cluster_uid
            .as_deref()
            .context("head_node.cluster_uid is required for discovery")?;

        let mut parts = command.split_whitespace();
        let program = parts.next().context("Empty head_node.discovery_command")?;

        log::info!(
            "Searching for the HPC head node in cluster {cluster_uid} (role {}, recipe {})",
            config.role_tag,
            config.recipe_tag
        );
        let output = Invocation::new(program)
            .args(parts)
            .args([cluster_uid, config.role_tag.as_str(), config.recipe_tag.as_str()])
            .timeout(Duration::from_secs(120))
            .capture()
            .context("Head node discovery failed")?;

        let found = parse(&output)?;
        log::info!(
            "Head node {} found: IP={}, FQDN={}",
            found.hostname,
            found.ip_address.as_deref().unwrap_or("-"),
            found.fqdn.as_deref().unwrap_or("-")
        );
        Ok(found)
    }
}

fn parse(output: &str) -> Result<HeadNode> {
    let node: HeadNode =
        serde_json::from_str(output.trim()).context("Discovery output is not valid JSON")?;
    if node.hostname.trim().is_empty() {
        anyhow::bail!("HPC head node not found");
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_hostname_wins() {
        let config = HeadNodeConfig {
            hostname: Some("hn-01".into()),
            ip_address: Some("10.0.0.5".into()),
            discovery_command: Some("does-not-exist".into()),
            ..HeadNodeConfig::default()
        };
        let hn = CommandLocator.locate(&config).unwrap();
        assert_eq!(hn.hostname, "hn-01");
        assert_eq!(hn.ip_address.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn test_no_source_is_an_error() {
        assert!(CommandLocator.locate(&HeadNodeConfig::default()).is_err());
    }

    #[test]
    fn test_parse_discovery_output() {
        let hn = parse(r#"{"hostname":"hn-01","ip_address":"10.0.0.5","fqdn":"hn-01.hpc.local"}"#)
            .unwrap();
        assert_eq!(hn.fqdn.as_deref(), Some("hn-01.hpc.local"));

        assert!(parse(r#"{"hostname":""}"#).is_err());
        assert!(parse("not json").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_runs_discovery_command() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("find-hn.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"{\\\"hostname\\\":\\\"hn-$1\\\",\\\"ip_address\\\":\\\"10.0.0.5\\\"}\"\n",
        )
        .unwrap();

        let config = HeadNodeConfig {
            cluster_uid: Some("c42".into()),
            discovery_command: Some(format!("sh {}", script.display())),
            ..HeadNodeConfig::default()
        };
        let hn = CommandLocator.locate(&config).unwrap();
        assert_eq!(hn.hostname, "hn-c42");
    }
}

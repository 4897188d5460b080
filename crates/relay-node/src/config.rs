//! Node configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file
//! - Environment variables (RELAY_*)
//!
//! The channel section is data consumed once at node construction: global
//! default options plus an ordered namespace list.

use anyhow::{Context, Result};
use relay_core::{ChannelOptions, PolicyError, PolicyRegistry};
use relay_proto::NodeId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name within the cluster. Generated when absent.
    #[serde(default = "default_name")]
    pub name: Option<String>,

    /// Channel policy configuration.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Presence configuration.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Subscriber delivery configuration.
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// Channel policy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Options for channels outside any configured namespace.
    #[serde(default, rename = "default")]
    pub default_options: ChannelOptions,

    /// Namespace policies, matched by channel prefix.
    #[serde(default)]
    pub namespaces: Vec<NamespaceConfig>,

    /// Reject channels with an unconfigured namespace prefix instead of
    /// falling back to the defaults.
    #[serde(default)]
    pub strict: bool,
}

/// One namespace policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Namespace name (channel prefix before `:`).
    pub name: String,

    /// Options applied to the namespace's channels.
    #[serde(flatten)]
    pub options: ChannelOptions,
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Liveness window in seconds; entries not refreshed within it are
    /// considered dead.
    #[serde(default = "default_liveness")]
    pub liveness_secs: u64,

    /// Interval of the background stale-entry sweep in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Subscriber delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Capacity of each subscriber's event queue; overflow disconnects the
    /// subscriber.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Publications buffered per subscription while a subscribe is in
    /// flight.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

// Default value functions
fn default_name() -> Option<String> {
    std::env::var("RELAY_NODE").ok()
}

fn default_liveness() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    15
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_buffer_capacity() -> usize {
    256
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            channels: ChannelsConfig::default(),
            presence: PresenceConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            liveness_secs: default_liveness(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: NodeConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Build the policy registry, validating every namespace.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid namespace names or options that enable
    /// recovery without history retention.
    pub fn policy_registry(&self) -> Result<PolicyRegistry, PolicyError> {
        PolicyRegistry::new(
            self.channels.default_options.clone(),
            self.channels
                .namespaces
                .iter()
                .map(|ns| (ns.name.clone(), ns.options.clone())),
            self.channels.strict,
        )
    }

    /// The node's cluster identity.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        match &self.name {
            Some(name) => NodeId::new(name.clone()),
            None => NodeId::generate(),
        }
    }

    /// Presence liveness window.
    #[must_use]
    pub fn liveness(&self) -> Duration {
        Duration::from_secs(self.presence.liveness_secs)
    }

    /// Presence sweep interval.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.presence.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.presence.liveness_secs, 60);
        assert_eq!(config.delivery.queue_capacity, 1024);
        assert!(config.channels.namespaces.is_empty());
        assert!(!config.channels.strict);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            name = "node-1"

            [channels.default]
            publish_allowed = true

            [[channels.namespaces]]
            name = "chat"
            publish_allowed = true
            presence_enabled = true
            join_leave_enabled = true
            history_size = 1000
            history_lifetime_secs = 60
            recovery_enabled = true

            [presence]
            liveness_secs = 30
        "#;

        let config: NodeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.name.as_deref(), Some("node-1"));
        assert!(config.channels.default_options.publish_allowed);
        assert_eq!(config.presence.liveness_secs, 30);

        let registry = config.policy_registry().unwrap();
        let chat = registry.resolve("chat:lobby").unwrap();
        assert!(chat.recovery_enabled);
        assert_eq!(chat.history_size, 1000);
    }

    #[test]
    fn test_recovery_without_history_is_a_config_error() {
        let toml_str = r#"
            [[channels.namespaces]]
            name = "broken"
            recovery_enabled = true
        "#;

        let config: NodeConfig = toml::from_str(toml_str).unwrap();
        assert!(matches!(
            config.policy_registry(),
            Err(PolicyError::RecoveryWithoutHistory(ns)) if ns == "broken"
        ));
    }

    #[test]
    fn test_node_id_uses_configured_name() {
        let config = NodeConfig {
            name: Some("node-7".to_string()),
            ..NodeConfig::default()
        };
        assert_eq!(config.node_id().as_str(), "node-7");
    }
}

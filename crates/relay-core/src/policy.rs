//! Channel policy resolution.
//!
//! Channels are grouped into namespaces by a `:`-separated prefix; each
//! namespace carries its own options, everything else falls back to the
//! global defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::history::HistoryRetention;

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Separator between a channel's namespace prefix and the rest of its name.
pub const NAMESPACE_SEPARATOR: char = ':';

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// Effective options of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    /// Whether clients may publish into the channel.
    pub publish_allowed: bool,
    /// Whether the presence registry tracks the channel.
    pub presence_enabled: bool,
    /// Whether join/leave events are broadcast to subscribers.
    pub join_leave_enabled: bool,
    /// Maximum number of retained history entries (0 disables history).
    pub history_size: usize,
    /// Retention time of history entries in seconds (0 disables history).
    pub history_lifetime_secs: u64,
    /// Whether reconnecting subscribers may recover missed publications.
    pub recovery_enabled: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            publish_allowed: false,
            presence_enabled: false,
            join_leave_enabled: false,
            history_size: 0,
            history_lifetime_secs: 0,
            recovery_enabled: false,
        }
    }
}

impl ChannelOptions {
    /// Whether the channel keeps a history log at all.
    #[must_use]
    pub fn history_enabled(&self) -> bool {
        self.history_size > 0 && self.history_lifetime_secs > 0
    }

    /// History retention limits derived from these options.
    #[must_use]
    pub fn retention(&self) -> HistoryRetention {
        HistoryRetention {
            max_entries: self.history_size,
            lifetime: Duration::from_secs(self.history_lifetime_secs),
        }
    }
}

/// Policy resolution errors.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Channel has a namespace prefix with no configured namespace.
    #[error("Unknown channel namespace: {0}")]
    UnknownNamespace(String),

    /// Namespace name rejected at construction.
    #[error("Invalid namespace {0:?}: {1}")]
    InvalidNamespace(String, &'static str),

    /// Recovery enabled on a namespace that retains no history.
    #[error("Namespace {0:?} enables recovery without history retention")]
    RecoveryWithoutHistory(String),
}

/// Read-only registry mapping channel names to their effective options.
///
/// Built once at node construction; safe to share and call concurrently.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    default_options: ChannelOptions,
    namespaces: HashMap<String, ChannelOptions>,
    strict: bool,
}

impl PolicyRegistry {
    /// Build a registry from default options and a namespace list.
    ///
    /// With `strict` set, resolving a channel whose namespace prefix is not
    /// configured fails instead of falling back to the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid namespace name, or for any options
    /// (defaults included) that enable recovery while retaining no history.
    pub fn new(
        default_options: ChannelOptions,
        namespaces: impl IntoIterator<Item = (String, ChannelOptions)>,
        strict: bool,
    ) -> Result<Self, PolicyError> {
        validate_options("default", &default_options)?;

        let mut map = HashMap::new();
        for (name, options) in namespaces {
            if name.is_empty() {
                return Err(PolicyError::InvalidNamespace(
                    name,
                    "namespace name cannot be empty",
                ));
            }
            if name.contains(NAMESPACE_SEPARATOR) {
                return Err(PolicyError::InvalidNamespace(
                    name,
                    "namespace name cannot contain the separator",
                ));
            }
            if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
                return Err(PolicyError::InvalidNamespace(
                    name,
                    "namespace name contains invalid characters",
                ));
            }
            validate_options(&name, &options)?;
            map.insert(name, options);
        }

        Ok(Self {
            default_options,
            namespaces: map,
            strict,
        })
    }

    /// Resolve a channel name to its effective options.
    ///
    /// An exact namespace match takes precedence over the defaults; a
    /// channel without a namespace prefix always uses the defaults.
    ///
    /// # Errors
    ///
    /// In strict mode, returns `UnknownNamespace` when the channel carries
    /// an unconfigured namespace prefix.
    pub fn resolve(&self, channel: &str) -> Result<ChannelOptions, PolicyError> {
        match channel.split_once(NAMESPACE_SEPARATOR) {
            Some((namespace, _)) => match self.namespaces.get(namespace) {
                Some(options) => Ok(options.clone()),
                None if self.strict => Err(PolicyError::UnknownNamespace(namespace.to_string())),
                None => Ok(self.default_options.clone()),
            },
            None => Ok(self.default_options.clone()),
        }
    }

    /// Get the configured namespace names.
    #[must_use]
    pub fn namespace_names(&self) -> Vec<&str> {
        self.namespaces.keys().map(|s| s.as_str()).collect()
    }
}

fn validate_options(namespace: &str, options: &ChannelOptions) -> Result<(), PolicyError> {
    if options.recovery_enabled && !options.history_enabled() {
        return Err(PolicyError::RecoveryWithoutHistory(namespace.to_string()));
    }
    Ok(())
}

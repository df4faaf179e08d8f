use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_ssh2_tokio::ServerCheckMethod;
use log::debug;
use russh::Preferred;
use russh::keys::PublicKey;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config;

/// Security level used for SSH algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Strict modern algorithms.
    Secure,
    /// Good security with broader compatibility (default, most routers need it).
    #[default]
    Balanced,
    /// Maximum compatibility with legacy devices.
    LegacyCompatible,
}

/// Connection security options for SSH establishment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSecurityOptions {
    /// SSH algorithm policy.
    pub level: SecurityLevel,
    /// Server host key verification method.
    pub server_check: ServerCheckMethod,
}

impl Default for ConnectionSecurityOptions {
    fn default() -> Self {
        Self::balanced()
    }
}

impl ConnectionSecurityOptions {
    /// Modern algorithms, host keys checked against `~/.ssh/known_hosts`.
    pub fn secure_default() -> Self {
        Self {
            level: SecurityLevel::Secure,
            server_check: ServerCheckMethod::DefaultKnownHostsFile,
        }
    }

    /// Balanced algorithms, host keys not checked.
    ///
    /// Lab and management networks re-image devices constantly, which makes
    /// host key pinning the first thing operators turn off.
    pub fn balanced() -> Self {
        Self {
            level: SecurityLevel::Balanced,
            server_check: ServerCheckMethod::NoCheck,
        }
    }

    /// Legacy compatibility profile for older devices.
    pub fn legacy_compatible() -> Self {
        Self {
            level: SecurityLevel::LegacyCompatible,
            server_check: ServerCheckMethod::NoCheck,
        }
    }

    pub(super) fn preferred(&self) -> Preferred {
        match self.level {
            SecurityLevel::Secure => Preferred {
                kex: Cow::Borrowed(config::SECURE_KEX_ORDER),
                key: Cow::Borrowed(config::SECURE_KEY_TYPES),
                cipher: Cow::Borrowed(config::SECURE_CIPHERS),
                mac: Cow::Borrowed(config::SECURE_MAC_ALGORITHMS),
                compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
            },
            SecurityLevel::Balanced => Preferred {
                kex: Cow::Borrowed(config::BALANCED_KEX_ORDER),
                key: Cow::Borrowed(config::BALANCED_KEY_TYPES),
                cipher: Cow::Borrowed(config::BALANCED_CIPHERS),
                mac: Cow::Borrowed(config::BALANCED_MAC_ALGORITHMS),
                compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
            },
            SecurityLevel::LegacyCompatible => Preferred {
                kex: Cow::Borrowed(config::LEGACY_KEX_ORDER),
                key: Cow::Borrowed(config::LEGACY_KEY_TYPES),
                cipher: Cow::Borrowed(config::LEGACY_CIPHERS),
                mac: Cow::Borrowed(config::LEGACY_MAC_ALGORITHMS),
                compression: Cow::Borrowed(config::DEFAULT_COMPRESSION_ALGORITHMS),
            },
        }
    }

    /// russh client configuration with this policy and transport keepalives.
    ///
    /// russh closes the connection after three unanswered keepalives, which the
    /// session supervisor then observes as a closed transport.
    pub(super) fn client_config(&self, keepalive: Option<Duration>) -> russh::client::Config {
        russh::client::Config {
            preferred: self.preferred(),
            inactivity_timeout: Some(Duration::from_secs(60)),
            keepalive_interval: keepalive,
            keepalive_max: 3,
            ..Default::default()
        }
    }

    pub(super) fn shared_client_config(
        &self,
        keepalive: Option<Duration>,
    ) -> Arc<russh::client::Config> {
        Arc::new(self.client_config(keepalive))
    }

    /// Verifies a host key presented over a tunnel, where async-ssh2-tokio's
    /// own check is not available.
    pub(super) fn accepts_server_key(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        let accepted = match &self.server_check {
            ServerCheckMethod::NoCheck => true,
            ServerCheckMethod::PublicKey(encoded) => russh::keys::parse_public_key_base64(encoded)
                .map(|expected| &expected == key)
                .unwrap_or(false),
            ServerCheckMethod::PublicKeyFile(path) => russh::keys::load_public_key(path)
                .map(|expected| &expected == key)
                .unwrap_or(false),
            ServerCheckMethod::KnownHostsFile(path) => {
                russh::keys::check_known_hosts_path(host, port, key, path).unwrap_or(false)
            }
            ServerCheckMethod::DefaultKnownHostsFile => {
                russh::keys::check_known_hosts(host, port, key).unwrap_or(false)
            }
            #[allow(unreachable_patterns)]
            _ => false,
        };
        if !accepted {
            debug!("{host}:{port} host key rejected by {:?}", self.server_check);
        }
        accepted
    }
}

//! SSH algorithm tables and protocol defaults.
//!
//! Network devices in the field run anything from current OpenSSH builds to
//! decade-old embedded stacks, so algorithm preferences come in three tiers
//! selected by [`crate::session::SecurityLevel`]. The rest of this module holds
//! the timeouts and pool sizes used when the caller does not override them.

use std::time::Duration;

use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{cipher, compression, kex, mac};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default TCP + SSH handshake timeout, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 30;
/// Default single command timeout, in seconds.
pub const DEFAULT_CMD_TIMEOUT: u64 = 15;
/// Default keepalive probe interval, in seconds.
pub const DEFAULT_KEEPALIVE: u64 = 5;
/// Default delay between two connect attempts, in seconds.
pub const DEFAULT_RECONNECT_TIMEOUT: u64 = 15;
/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

pub const MAX_SIMULTANEOUS_CONNECTIONS: usize = 64;
pub const MAX_SIMULTANEOUS_EXECUTIONS: usize = 64;
pub const MAX_SIMULTANEOUS_DOWNLOADS: usize = 2;
pub const MAX_SIMULTANEOUS_UPLOADS: usize = 2;

/// Per-session connection and command settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SessionOptions {
    /// SSH port used for every endpoint.
    pub port: u16,
    /// Handshake timeout for one connect attempt (seconds).
    pub connect_timeout_secs: u64,
    /// Number of connect attempts before giving up.
    pub connect_attempts: u32,
    /// Pause between connect attempts (seconds).
    pub reconnect_timeout_secs: u64,
    /// Command timeout used when the caller does not pass one (seconds).
    pub command_timeout_secs: u64,
    /// Keepalive probe interval (seconds). Zero disables supervision.
    pub keepalive_secs: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT,
            connect_attempts: 1,
            reconnect_timeout_secs: DEFAULT_RECONNECT_TIMEOUT,
            command_timeout_secs: DEFAULT_CMD_TIMEOUT,
            keepalive_secs: DEFAULT_KEEPALIVE,
        }
    }
}

impl SessionOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Keepalive interval, `None` when supervision is disabled.
    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs))
    }
}

/// Capacities of the four resource pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PoolLimits {
    /// Sessions allowed to be connected at the same time.
    pub connections: usize,
    /// Commands allowed to run at the same time.
    pub executions: usize,
    /// Concurrent downloads.
    pub downloads: usize,
    /// Concurrent uploads.
    pub uploads: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            connections: MAX_SIMULTANEOUS_CONNECTIONS,
            executions: MAX_SIMULTANEOUS_EXECUTIONS,
            downloads: MAX_SIMULTANEOUS_DOWNLOADS,
            uploads: MAX_SIMULTANEOUS_UPLOADS,
        }
    }
}

/// Modern key exchange algorithms only.
pub const SECURE_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
];

/// Modern key exchange plus group-exchange SHA-256 still common on routers.
pub const BALANCED_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::DH_GEX_SHA256,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
    kex::DH_G14_SHA1,
];

/// Everything russh can speak, including SHA-1 groups for legacy devices.
pub const LEGACY_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::DH_GEX_SHA1,
    kex::DH_GEX_SHA256,
    kex::DH_G1_SHA1,
    kex::DH_G14_SHA1,
    kex::DH_G14_SHA256,
    kex::DH_G15_SHA512,
    kex::DH_G16_SHA512,
    kex::DH_G17_SHA512,
    kex::DH_G18_SHA512,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
    kex::NONE,
];

pub const SECURE_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
];

pub const BALANCED_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
    cipher::AES_256_CBC,
    cipher::AES_128_CBC,
];

/// Includes CBC modes and the null cipher for very old devices.
pub const LEGACY_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
    cipher::AES_256_CBC,
    cipher::AES_192_CBC,
    cipher::AES_128_CBC,
    cipher::CLEAR,
    cipher::NONE,
];

pub const SECURE_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
];

pub const BALANCED_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA1,
];

pub const LEGACY_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA1_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
    mac::HMAC_SHA1,
    mac::NONE,
];

pub const DEFAULT_COMPRESSION_ALGORITHMS: &[compression::Name] = &[
    compression::NONE,
    compression::ZLIB,
    compression::ZLIB_LEGACY,
];

pub const SECURE_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
];

pub const BALANCED_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa { hash: None },
];

/// Host key algorithms including SHA-1 RSA and DSA.
pub const LEGACY_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP521,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa { hash: None },
    Algorithm::Dsa,
];

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Timeout for the OS-level connect, in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3_000;

/// Time the client waits for the server's welcome after connecting.
pub const DEFAULT_WELCOME_TIMEOUT_MS: u64 = 2_000;

/// Progressive cool-down schedule between reconnect attempts. The
/// pointer saturates at the last slot and resets on a successful
/// connect.
pub const DEFAULT_COOLDOWN_MS: [u64; 8] =
    [5_000, 5_000, 5_000, 10_000, 10_000, 20_000, 30_000, 60_000];

/// Default server-side answer deadline carried in a request.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

/// Default time a verb may wait in the backlog for the link to come up.
pub const DEFAULT_TTL_MS: u64 = 5_000;

const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Runtime parameters for a channel and its connection. All timers
/// default to the protocol constants; deployments override them via a
/// YAML file.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
}

/// Knobs of the connection state machine.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_ms: u64,
    pub welcome_timeout_ms: u64,
    pub cooldown_ms: Vec<u64>,
    pub read_chunk_size: usize,
    pub nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            welcome_timeout_ms: DEFAULT_WELCOME_TIMEOUT_MS,
            cooldown_ms: DEFAULT_COOLDOWN_MS.to_vec(),
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            nodelay: true,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn welcome_timeout(&self) -> Duration {
        Duration::from_millis(self.welcome_timeout_ms)
    }
}

/// Defaults applied by the channel when a handle does not specify its
/// own timeout or ttl.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct ChannelConfig {
    pub request_timeout_ms: u64,
    pub ttl_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            ttl_ms: DEFAULT_TTL_MS,
        }
    }
}

impl ChannelConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path:?}"))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {path:?}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.connection.cooldown_ms.is_empty(),
            "cooldown schedule must have at least one slot"
        );
        ensure!(
            self.connection.read_chunk_size > 0,
            "read chunk size must be greater than zero"
        );
        Ok(())
    }
}

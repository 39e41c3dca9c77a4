// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Configuration map and recognized option keys.
//!
//! Options arrive from two places: the locator's query parameters and an
//! explicit configuration map. [`Config::resolve`] merges them; the map wins
//! only when `configOverridesLocator` is set (in either source), otherwise
//! locator parameters win.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Recognized configuration keys.
pub mod keys {
    /// Turn on client lease establishment (bool).
    pub const ENABLE_LEASE: &str = "enableLease";
    /// Lease period the client asks for (ms).
    pub const LEASE_PERIOD: &str = "leasePeriod";
    /// Server default lease period (ms); 0 or absent disables leasing.
    pub const CLIENT_LEASE_PERIOD: &str = "clientLeasePeriod";
    /// Connection validator ping period (ms).
    pub const VALIDATOR_PING_PERIOD: &str = "validatorPingPeriod";
    /// Connection validator ping timeout (ms).
    pub const VALIDATOR_PING_TIMEOUT: &str = "validatorPingTimeout";
    /// Validator asks the server whether the lease is still alive (bool).
    pub const TIE_TO_LEASE: &str = "tieToLease";
    /// Validator failure force-stops the lease pinger (bool).
    pub const STOP_LEASE_ON_FAILURE: &str = "stopLeaseOnFailure";
    /// Timestamp-ordered lease snapshots (bool).
    pub const USE_CLIENT_CONNECTION_IDENTITY: &str = "useClientConnectionIdentity";
    /// Delay before a disconnected client's invoker is released (ms).
    pub const INVOKER_DESTRUCTION_DELAY: &str = "invokerDestructionDelay";
    /// Teardown timeout: 0 skips network I/O, negative uses the default (ms).
    pub const DISCONNECT_TIMEOUT: &str = "disconnectTimeout";
    /// Bypass the in-process loopback even if a local server matches (bool).
    pub const FORCE_REMOTE: &str = "forceRemote";
    /// Explicit config map entries beat locator parameters (bool).
    pub const CONFIG_OVERRIDES_LOCATOR: &str = "configOverridesLocator";
    /// Pull-callback polling period (ms).
    pub const CALLBACK_POLL_PERIOD: &str = "callbackPollPeriod";
    /// Locator for the server-to-client callback connector.
    pub const CALLBACK_LOCATOR: &str = "callbackLocator";
    /// Worker count of the oneway pool.
    pub const MAX_NUM_THREADS_ONEWAY: &str = "maxNumThreadsOneway";
    /// Queue bound of the oneway pool.
    pub const MAX_ONEWAY_QUEUE_SIZE: &str = "maxOnewayThreadPoolQueueSize";
    /// Per-call transport timeout (ms).
    pub const TIMEOUT: &str = "timeout";
}

pub const DEFAULT_VALIDATOR_PING_PERIOD: Duration = Duration::from_millis(2000);
pub const DEFAULT_VALIDATOR_PING_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_LEASE_PERIOD: Duration = Duration::from_millis(5000);
pub const DEFAULT_CALLBACK_POLL_PERIOD: Duration = Duration::from_millis(5000);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(60_000);
pub const DEFAULT_ONEWAY_THREADS: usize = 10;
pub const DEFAULT_ONEWAY_QUEUE_SIZE: usize = 100;

/// How teardown traffic is bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectTimeout {
    /// Skip all network I/O (peer already known dead or fast teardown).
    SkipNetwork,
    /// Use the transport's own timeout.
    #[default]
    TransportDefault,
    /// Explicit per-call timeout.
    Explicit(Duration),
}

impl DisconnectTimeout {
    /// Map the signed millisecond encoding used in configuration maps.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => DisconnectTimeout::SkipNetwork,
            ms if ms < 0 => DisconnectTimeout::TransportDefault,
            ms => DisconnectTimeout::Explicit(Duration::from_millis(ms as u64)),
        }
    }

    pub fn skips_network(self) -> bool {
        self == DisconnectTimeout::SkipNetwork
    }

    /// Timeout to put on a teardown request, if any.
    pub fn per_call(self) -> Option<Duration> {
        match self {
            DisconnectTimeout::Explicit(d) => Some(d),
            _ => None,
        }
    }
}

/// String-keyed configuration map.
///
/// Ordered so that equality and iteration are deterministic; registry holders
/// compare configs by deep equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Config(BTreeMap<String, String>);

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// Boolean option; unparsable values fall back to `default`.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            None => default,
            Some(v) if v.eq_ignore_ascii_case("true") => true,
            Some(v) if v.eq_ignore_ascii_case("false") => false,
            Some(v) => {
                log::warn!("[config] {}={} is not a boolean, using {}", key, v, default);
                default
            }
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        let raw = self.get(key)?;
        match raw.trim().parse::<i64>() {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("[config] {}={} is not an integer, ignoring", key, raw);
                None
            }
        }
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get_i64(key)
            .filter(|v| *v > 0)
            .map_or(default, |v| v as usize)
    }

    /// Non-negative millisecond option as a `Duration`.
    pub fn get_millis(&self, key: &str) -> Option<Duration> {
        self.get_i64(key)
            .filter(|v| *v >= 0)
            .map(|v| Duration::from_millis(v as u64))
    }

    pub fn get_millis_or(&self, key: &str, default: Duration) -> Duration {
        self.get_millis(key).unwrap_or(default)
    }

    pub fn disconnect_timeout(&self) -> DisconnectTimeout {
        self.get_i64(keys::DISCONNECT_TIMEOUT)
            .map(DisconnectTimeout::from_millis)
            .unwrap_or_default()
    }

    /// Merge locator parameters with an explicit map.
    ///
    /// Locator parameters win unless `configOverridesLocator` is true in the
    /// explicit map, or (absent there) in the locator parameters.
    pub fn resolve(locator_params: &BTreeMap<String, String>, explicit: &Config) -> Config {
        let from_locator = Config(locator_params.clone());
        let overrides = match explicit.get(keys::CONFIG_OVERRIDES_LOCATOR) {
            Some(_) => explicit.get_bool(keys::CONFIG_OVERRIDES_LOCATOR, false),
            None => from_locator.get_bool(keys::CONFIG_OVERRIDES_LOCATOR, false),
        };

        let (base, top) = if overrides {
            (from_locator, explicit)
        } else {
            (explicit.clone(), &from_locator)
        };
        let mut merged = base;
        for (k, v) in top.iter() {
            merged.0.insert(k.clone(), v.clone());
        }
        merged
    }
}

impl From<BTreeMap<String, String>> for Config {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Config {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

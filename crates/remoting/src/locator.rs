// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Endpoint addressing.
//!
//! A [`Locator`] names a remote endpoint:
//!
//! ```text
//! protocol://host[:port][/path][?k1=v1&k2=v2...]
//! ```
//!
//! Equality and hashing use the canonical URI (parameters sorted), so two
//! locators written with parameters in a different order are equal.
//! [`Locator::is_same_endpoint`] is the weaker relation that ignores path and
//! parameters.
//!
//! # Multi-home
//!
//! A locator whose host is the `multihome` placeholder carries alternate
//! endpoints in the `homes` (bind) and `connecthomes` (connect) parameters,
//! encoded as `host1:port1!host2:port2`. Exactly one home is "in use" at a
//! time; the home list and home-in-use are replaced together.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Placeholder host of multi-home locators.
pub const MULTIHOME: &str = "multihome";
/// Parameter listing bind homes.
pub const HOMES_KEY: &str = "homes";
/// Parameter listing connect homes.
pub const CONNECT_HOMES_KEY: &str = "connecthomes";

const HOME_SEPARATOR: char = '!';

/// One concrete host/port alternative of a multi-home locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Home {
    pub host: String,
    pub port: Option<u16>,
}

impl Home {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Home {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_host(f, &self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

impl FromStr for Home {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = split_host_port(s)?;
        Ok(Home::new(resolve_host(&host), port))
    }
}

/// Address of a remote endpoint.
#[derive(Clone)]
pub struct Locator {
    protocol: String,
    host: String,
    port: Option<u16>,
    path: String,
    params: BTreeMap<String, String>,
    homes: Vec<Home>,
    connect_homes: Vec<Home>,
    home_in_use: Option<Home>,
    canonical: String,
}

impl Locator {
    /// Parse a locator URI.
    ///
    /// An empty host or `0.0.0.0` resolves to this machine's externally
    /// reachable address.
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        let (protocol, rest) = uri
            .split_once("://")
            .ok_or_else(|| Error::InvalidLocator(format!("missing '://' in '{}'", uri)))?;
        if protocol.is_empty()
            || !protocol
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(Error::InvalidLocator(format!(
                "bad protocol '{}' in '{}'",
                protocol, uri
            )));
        }

        let (before_query, query) = match rest.split_once('?') {
            Some((b, q)) => (b, Some(q)),
            None => (rest, None),
        };
        let (authority, path) = before_query.split_once('/').unwrap_or((before_query, ""));

        let (host, port) = split_host_port(authority)?;
        let params = parse_query(query.unwrap_or(""));

        Self::build(
            protocol.to_ascii_lowercase(),
            resolve_host(&host),
            port,
            path.trim_end_matches('/').to_string(),
            params,
        )
    }

    /// Locator from parts, no path or parameters.
    pub fn new(protocol: &str, host: &str, port: Option<u16>) -> Result<Self> {
        Self::build(
            protocol.to_ascii_lowercase(),
            resolve_host(host),
            port,
            String::new(),
            BTreeMap::new(),
        )
    }

    fn build(
        protocol: String,
        host: String,
        port: Option<u16>,
        path: String,
        params: BTreeMap<String, String>,
    ) -> Result<Self> {
        let homes = match params.get(HOMES_KEY) {
            Some(list) => parse_homes(list, port)?,
            None => Vec::new(),
        };
        let connect_homes = match params.get(CONNECT_HOMES_KEY) {
            Some(list) => parse_homes(list, port)?,
            None => Vec::new(),
        };
        if host == MULTIHOME && homes.is_empty() && connect_homes.is_empty() {
            return Err(Error::InvalidLocator(format!(
                "{}://{} names no homes",
                protocol, MULTIHOME
            )));
        }

        let mut locator = Self {
            protocol,
            host,
            port,
            path,
            params,
            homes,
            connect_homes,
            home_in_use: None,
            canonical: String::new(),
        };
        locator.canonical = locator.render();
        Ok(locator)
    }

    fn render(&self) -> String {
        use std::fmt::Write;

        let mut out = format!("{}://", self.protocol);
        let _ = write!(out, "{}", Home::new(self.host.clone(), self.port));
        if !self.path.is_empty() || !self.params.is_empty() {
            out.push('/');
            out.push_str(&self.path);
        }
        if !self.params.is_empty() {
            out.push('?');
            let query: Vec<String> = self
                .params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            out.push_str(&query.join("&"));
        }
        out
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Host; the `multihome` placeholder for multi-home locators.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Canonical URI used for equality.
    pub fn uri(&self) -> &str {
        &self.canonical
    }

    pub fn is_multihome(&self) -> bool {
        self.host == MULTIHOME
    }

    pub fn homes(&self) -> &[Home] {
        &self.homes
    }

    pub fn connect_homes(&self) -> &[Home] {
        &self.connect_homes
    }

    pub fn home_in_use(&self) -> Option<&Home> {
        self.home_in_use.as_ref()
    }

    /// Replace the home list and the home in use together.
    ///
    /// Callers sharing a locator must serialize this themselves.
    pub fn set_homes(&mut self, homes: Vec<Home>, in_use: Option<Home>) {
        self.homes = homes;
        self.home_in_use = in_use;
    }

    /// Concrete host/port to dial: the home in use, else the first connect
    /// home, else the first home, else host/port.
    pub fn connect_address(&self) -> Home {
        if let Some(home) = &self.home_in_use {
            return home.clone();
        }
        if self.is_multihome() {
            if let Some(home) = self.connect_homes.first().or_else(|| self.homes.first()) {
                return home.clone();
            }
        }
        Home::new(self.host.clone(), self.port)
    }

    /// Same protocol, host and port, regardless of path and parameters.
    pub fn is_same_endpoint(&self, other: &Locator) -> bool {
        if !self.protocol.eq_ignore_ascii_case(&other.protocol) {
            return false;
        }
        if self.is_multihome() || other.is_multihome() {
            return self.homes == other.homes && self.connect_homes == other.connect_homes;
        }
        self.host.eq_ignore_ascii_case(&other.host) && self.port == other.port
    }

    /// Copy with a different port (used once an ephemeral port is bound).
    #[must_use]
    pub fn with_port(&self, port: u16) -> Locator {
        let mut copy = self.clone();
        copy.port = Some(port);
        copy.canonical = copy.render();
        copy
    }

    /// Copy with one parameter added or replaced.
    pub fn with_parameter(&self, key: &str, value: &str) -> Result<Locator> {
        let mut params = self.params.clone();
        params.insert(key.to_string(), value.to_string());
        Self::build(
            self.protocol.clone(),
            self.host.clone(),
            self.port,
            self.path.clone(),
            params,
        )
    }

    /// Copy with a different path.
    #[must_use]
    pub fn with_path(&self, path: &str) -> Locator {
        let mut copy = self.clone();
        copy.path = path.trim_matches('/').to_string();
        copy.canonical = copy.render();
        copy
    }
}

impl PartialEq for Locator {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for Locator {}

impl Hash for Locator {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Debug for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Locator({})", self.canonical)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl FromStr for Locator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Locator::parse(s)
    }
}

impl Serialize for Locator {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical)
    }
}

impl<'de> Deserialize<'de> for Locator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Locator::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn write_host(f: &mut fmt::Formatter<'_>, host: &str) -> fmt::Result {
    if host.contains(':') {
        write!(f, "[{}]", host)
    } else {
        f.write_str(host)
    }
}

fn split_host_port(authority: &str) -> Result<(String, Option<u16>)> {
    let parse_port = |raw: &str| -> Result<Option<u16>> {
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse::<u16>()
            .map(Some)
            .map_err(|_| Error::InvalidLocator(format!("bad port '{}'", raw)))
    };

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| Error::InvalidLocator(format!("unclosed '[' in '{}'", authority)))?;
        let port = match after.strip_prefix(':') {
            Some(p) => parse_port(p)?,
            None if after.is_empty() => None,
            None => {
                return Err(Error::InvalidLocator(format!(
                    "garbage after ']' in '{}'",
                    authority
                )))
            }
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
        None => Ok((authority.to_string(), None)),
    }
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn parse_homes(list: &str, default_port: Option<u16>) -> Result<Vec<Home>> {
    list.split(HOME_SEPARATOR)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let mut home: Home = s.parse()?;
            if home.port.is_none() {
                home.port = default_port;
            }
            Ok(home)
        })
        .collect()
}

/// Replace wildcard hosts with this machine's reachable address.
fn resolve_host(host: &str) -> String {
    if !host.is_empty() && host != "0.0.0.0" {
        return host.to_string();
    }
    match local_ip_address::local_ip() {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            log::debug!("[locator] no local address ({}), using 127.0.0.1", e);
            "127.0.0.1".to_string()
        }
    }
}

//! Named operation groups an API key may be granted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// `*`: satisfies every requirement.
    Wildcard,
    /// Create, delete, and inspect workloads.
    Workloads,
    /// Exec, connect, and log/metric streams.
    Sessions,
    Snapshots,
    /// Upload and download.
    Files,
    Templates,
    Metrics,
    Namespaces,
    Secrets,
    /// API keys, quota ceilings, health reports. Also bypasses ownership.
    Admin,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Wildcard => "*",
            Scope::Workloads => "workloads",
            Scope::Sessions => "sessions",
            Scope::Snapshots => "snapshots",
            Scope::Files => "files",
            Scope::Templates => "templates",
            Scope::Metrics => "metrics",
            Scope::Namespaces => "namespaces",
            Scope::Secrets => "secrets",
            Scope::Admin => "admin",
        }
    }

    /// Parse a list of scope names, rejecting unknown ones.
    pub fn parse_all<S: AsRef<str>>(names: &[S]) -> Result<Vec<Scope>, AuthError> {
        names.iter().map(|n| n.as_ref().parse()).collect()
    }
}

impl FromStr for Scope {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "*" => Scope::Wildcard,
            "workloads" => Scope::Workloads,
            "sessions" => Scope::Sessions,
            "snapshots" => Scope::Snapshots,
            "files" => Scope::Files,
            "templates" => Scope::Templates,
            "metrics" => Scope::Metrics,
            "namespaces" => Scope::Namespaces,
            "secrets" => Scope::Secrets,
            "admin" => Scope::Admin,
            other => return Err(AuthError::InvalidScope(other.to_string())),
        })
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

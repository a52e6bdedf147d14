//! Service configuration
//!
//! Defaults mirror the deployment the service grew up in: a `neo4j` host on
//! the compose network and a consumption bound equal to the batch size.
//! Environment variables layer over file/CLI values.

use crate::coordinator::BatchOptions;
use refinery_graph::CompilerOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineryConfig {
    /// Bolt URI of the graph store.
    pub store_uri: String,
    pub store_user: String,
    pub store_pass: String,
    /// Messages per batch transaction; also the transport prefetch bound.
    pub batch_size: usize,
    /// Flush a non-empty partial batch after this many milliseconds.
    pub linger_ms: u64,
    /// Reclassify ISO-8601 string properties as typed dates.
    pub infer_dates: bool,
}

impl Default for RefineryConfig {
    fn default() -> Self {
        Self {
            store_uri: "bolt://neo4j:7687".into(),
            store_user: "neo4j".into(),
            store_pass: "neo4j".into(),
            batch_size: 50,
            linger_ms: 250,
            infer_dates: true,
        }
    }
}

impl RefineryConfig {
    /// Apply `NEO4J_URL` / `NEO4J_USERNAME` / `NEO4J_PASSWORD` overrides
    /// from the process environment.
    pub fn from_env(self) -> Self {
        self.with_env(|name| std::env::var(name).ok())
    }

    fn with_env(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(uri) = var("NEO4J_URL") {
            self.store_uri = uri;
        }
        if let Some(user) = var("NEO4J_USERNAME") {
            self.store_user = user;
        }
        if let Some(pass) = var("NEO4J_PASSWORD") {
            self.store_pass = pass;
        }
        self
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            batch_size: self.batch_size.max(1),
            linger: Duration::from_millis(self.linger_ms),
            compiler: CompilerOptions {
                infer_dates: self.infer_dates,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_layer_over_defaults() {
        let config = RefineryConfig::default().with_env(|name| match name {
            "NEO4J_URL" => Some("bolt://graph.internal:7687".into()),
            "NEO4J_PASSWORD" => Some("s3cret".into()),
            _ => None,
        });
        assert_eq!(config.store_uri, "bolt://graph.internal:7687");
        assert_eq!(config.store_user, "neo4j");
        assert_eq!(config.store_pass, "s3cret");
    }

    #[test]
    fn batch_options_guard_against_zero_size() {
        let config = RefineryConfig {
            batch_size: 0,
            ..RefineryConfig::default()
        };
        assert_eq!(config.batch_options().batch_size, 1);
    }
}

//! Operator configuration
//!
//! Built-in defaults, overlaid by an optional TOML file, overlaid by CLI
//! flags and environment variables. The merged result is validated once at
//! startup.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::operations::OperationSettings;
use super::planner::PlanLimits;
use super::sidecar::DEFAULT_SIDECAR_PORT;

/// Tunables of the reconciliation core
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct OperatorConfig {
    /// Racks that may have a structural change in flight at once
    pub max_concurrent_rack_updates: usize,
    /// Transient failures tolerated per action or operation
    pub operation_retry_budget: u32,
    /// Requeue interval when nothing is in flight (seconds)
    pub steady_state_poll_interval: u64,
    /// Requeue interval while actions or operations are in flight (seconds)
    pub active_poll_interval: u64,
    /// Time an operation may stay Pending before it is failed (seconds)
    pub operation_pending_timeout: u64,
    pub node_operations_per_rack: usize,
    /// Reconcile workers
    pub workers: usize,
    pub sidecar_port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_rack_updates: 1,
            operation_retry_budget: 3,
            steady_state_poll_interval: 60,
            active_poll_interval: 10,
            operation_pending_timeout: 1800,
            node_operations_per_rack: 1,
            workers: 4,
            sidecar_port: DEFAULT_SIDECAR_PORT,
        }
    }
}

/// Command line / environment overrides; unset fields keep the file or default value
#[derive(clap::Args, Clone, Debug, Default)]
pub struct ConfigOverrides {
    #[arg(long, env = "MAX_CONCURRENT_RACK_UPDATES")]
    pub max_concurrent_rack_updates: Option<usize>,

    #[arg(long, env = "OPERATION_RETRY_BUDGET")]
    pub operation_retry_budget: Option<u32>,

    /// Seconds
    #[arg(long, env = "STEADY_STATE_POLL_INTERVAL")]
    pub steady_state_poll_interval: Option<u64>,

    /// Seconds
    #[arg(long, env = "ACTIVE_POLL_INTERVAL")]
    pub active_poll_interval: Option<u64>,

    /// Seconds
    #[arg(long, env = "OPERATION_PENDING_TIMEOUT")]
    pub operation_pending_timeout: Option<u64>,

    #[arg(long, env = "NODE_OPERATIONS_PER_RACK")]
    pub node_operations_per_rack: Option<usize>,

    #[arg(long, env = "RECONCILE_WORKERS")]
    pub workers: Option<usize>,

    #[arg(long, env = "SIDECAR_PORT")]
    pub sidecar_port: Option<u16>,
}

impl OperatorConfig {
    /// Read and parse a TOML config file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config TOML: {e}")))
    }

    /// Defaults, then the file (if any), then overrides; validated
    pub fn load(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let merged = base.with_overrides(overrides);
        merged.validate()?;
        Ok(merged)
    }

    pub fn with_overrides(mut self, overrides: &ConfigOverrides) -> Self {
        if let Some(v) = overrides.max_concurrent_rack_updates {
            self.max_concurrent_rack_updates = v;
        }
        if let Some(v) = overrides.operation_retry_budget {
            self.operation_retry_budget = v;
        }
        if let Some(v) = overrides.steady_state_poll_interval {
            self.steady_state_poll_interval = v;
        }
        if let Some(v) = overrides.active_poll_interval {
            self.active_poll_interval = v;
        }
        if let Some(v) = overrides.operation_pending_timeout {
            self.operation_pending_timeout = v;
        }
        if let Some(v) = overrides.node_operations_per_rack {
            self.node_operations_per_rack = v;
        }
        if let Some(v) = overrides.workers {
            self.workers = v;
        }
        if let Some(v) = overrides.sidecar_port {
            self.sidecar_port = v;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        let positive = [
            ("maxConcurrentRackUpdates", self.max_concurrent_rack_updates as u64),
            ("operationRetryBudget", self.operation_retry_budget as u64),
            ("steadyStatePollInterval", self.steady_state_poll_interval),
            ("activePollInterval", self.active_poll_interval),
            ("operationPendingTimeout", self.operation_pending_timeout),
            ("nodeOperationsPerRack", self.node_operations_per_rack as u64),
            ("workers", self.workers as u64),
            ("sidecarPort", self.sidecar_port as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                problems.push(format!("{name} must be greater than 0"));
            }
        }
        if self.active_poll_interval > self.steady_state_poll_interval {
            problems.push(format!(
                "activePollInterval ({}s) must not exceed steadyStatePollInterval ({}s)",
                self.active_poll_interval, self.steady_state_poll_interval
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::ConfigError(problems.join("; ")))
        }
    }

    pub fn steady_interval(&self) -> Duration {
        Duration::from_secs(self.steady_state_poll_interval)
    }

    pub fn active_interval(&self) -> Duration {
        Duration::from_secs(self.active_poll_interval)
    }

    pub fn plan_limits(&self) -> PlanLimits {
        PlanLimits {
            max_concurrent_rack_updates: self.max_concurrent_rack_updates,
        }
    }

    pub fn operation_settings(&self) -> OperationSettings {
        OperationSettings {
            retry_budget: self.operation_retry_budget,
            pending_timeout: Duration::from_secs(self.operation_pending_timeout),
            node_operations_per_rack: self.node_operations_per_rack,
        }
    }
}

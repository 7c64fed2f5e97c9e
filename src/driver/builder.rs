//! # Builder for connection drivers
//!
//! Drivers are described either by a serializable [`DriverConfig`] or assembled with
//! [`ConnectionBuilder`], which additionally accepts already constructed comms.

use std::{sync::Arc, time::Duration};

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use super::{ConnectionDriver, Forward, Relay};
use crate::{
    comm::{new_comm, CommConfig, Communicator, Direction},
    error::DriverError,
};

const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;
const DEFAULT_JOIN_TIMEOUT_MS: u64 = 5000;

/// Serializable description of a driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub name: String,
    pub inputs: Vec<CommConfig>,
    pub outputs: Vec<CommConfig>,

    /// Producers expected to sign off before the driver closes.
    pub input_models: Vec<String>,
    pub output_models: Vec<String>,

    /// Upper bound of a single receive, split between the inputs.
    pub poll_timeout_ms: u64,

    /// How long closing waits for the worker thread.
    pub join_timeout_ms: u64,
}

/// Collects comms and models, then builds a [`ConnectionDriver`] around a relay.
pub struct ConnectionBuilder {
    cfg: DriverConfig,
    icomms: Vec<Arc<dyn Communicator>>,
    ocomms: Vec<Arc<dyn Communicator>>,
}

// ========================================================== DriverConfig ===|

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            input_models: Vec::new(),
            output_models: Vec::new(),
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
        }
    }
}

impl DriverConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.max(1))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

// ========================================================== ConnectionBuilder ===|

impl ConnectionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(DriverConfig { name: name.into(), ..Default::default() })
    }

    pub fn from_config(cfg: DriverConfig) -> Self {
        Self { cfg, icomms: Vec::new(), ocomms: Vec::new() }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.cfg
    }

    pub fn with_input(mut self, config: CommConfig) -> Self {
        self.cfg.inputs.push(config);
        self
    }

    pub fn with_output(mut self, config: CommConfig) -> Self {
        self.cfg.outputs.push(config);
        self
    }

    /// Uses an existing comm as input, e.g. one of a transport that isn't registered.
    pub fn with_input_comm(mut self, comm: Arc<dyn Communicator>) -> Self {
        self.icomms.push(comm);
        self
    }

    pub fn with_output_comm(mut self, comm: Arc<dyn Communicator>) -> Self {
        self.ocomms.push(comm);
        self
    }

    pub fn with_input_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cfg.input_models.extend(models.into_iter().map(Into::into));
        self
    }

    pub fn with_output_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cfg.output_models.extend(models.into_iter().map(Into::into));
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.poll_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.join_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Number of outputs, counting both configurations and supplied comms.
    pub fn n_outputs(&self) -> usize {
        self.cfg.outputs.len() + self.ocomms.len()
    }

    pub fn build(self) -> Result<ConnectionDriver<Forward>, DriverError> {
        self.build_with(Forward)
    }

    /// Creates the comms and assembles a driver around `relay`. Nothing runs until
    /// [`ConnectionDriver::start`].
    pub fn build_with<R: Relay>(self, relay: R) -> Result<ConnectionDriver<R>, DriverError> {
        let Self { cfg, mut icomms, mut ocomms } = self;

        for config in &cfg.inputs {
            icomms.push(new_comm(config.clone())?);
        }
        for config in &cfg.outputs {
            ocomms.push(new_comm(config.clone())?);
        }

        let bad_direction = |comms: &[Arc<dyn Communicator>], expected: Direction| {
            comms.iter().find(|c| c.direction() != expected).map(|c| c.name().to_string())
        };

        if icomms.is_empty() || ocomms.is_empty() {
            Err(DriverError::Config("driver needs at least one input and one output".into()))
        } else if let Some(name) = bad_direction(&icomms, Direction::Recv) {
            Err(DriverError::Config(format!("input comm '{name}' doesn't receive").into()))
        } else if let Some(name) = bad_direction(&ocomms, Direction::Send) {
            Err(DriverError::Config(format!("output comm '{name}' doesn't send").into()))
        } else {
            let poll_timeout = cfg.poll_timeout();
            let join_timeout = cfg.join_timeout();

            tracing::debug!(
                driver = %cfg.name,
                n_inputs = icomms.len(),
                n_outputs = ocomms.len(),
                "driver created"
            );

            Ok(ConnectionDriver::from_parts(
                cfg.name,
                icomms,
                ocomms,
                cfg.input_models.into_iter().collect::<HashSet<_>>(),
                cfg.output_models.into_iter().collect::<HashSet<_>>(),
                poll_timeout,
                join_timeout,
                relay,
            ))
        }
    }
}

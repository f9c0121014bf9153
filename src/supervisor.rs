//! Puts the pieces together: config record, route controller, control
//! channel, and service lifecycle.

use crate::config::{self, Config, ConfigError};
use crate::daemon::{CommandHandler, ControlListener};
use crate::service::{ControlSignal, ServiceAdapter, ServiceError, ServiceState, StatusReporter};
use crate::transport::{AccessControl, Endpoint};
use crate::vpn::routing::{RouteController, RoutingError};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

pub const DEFAULT_ENDPOINT: &str = "mystpipe";
pub const DEFAULT_SERVICE_NAME: &str = "MystSupervisor";

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
}

/// Runtime settings; nothing here is persisted.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub endpoint: Endpoint,
    pub service_name: String,
    pub acl: AccessControl,
    pub config_path: PathBuf,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::new(DEFAULT_ENDPOINT),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            acl: AccessControl::platform_default(),
            config_path: config::default_path(),
        }
    }
}

pub struct Supervisor {
    options: SupervisorOptions,
    config: Config,
}

impl Supervisor {
    /// Read and validate the config record named in `options`.
    pub fn load(options: SupervisorOptions) -> Result<Self, SupervisorError> {
        let config = Config::load(&options.config_path)?;
        info!(
            "Using myst at {} and OpenVPN at {}",
            config.myst_path, config.openvpn_path
        );
        Ok(Self { options, config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    pub fn listener(&self) -> ControlListener {
        ControlListener::new(self.options.endpoint.clone(), self.options.acl.clone())
    }

    /// Serve the control channel until the service is told to stop.
    pub async fn run<R: StatusReporter>(
        self,
        signals: mpsc::Receiver<ControlSignal>,
        reporter: R,
    ) -> Result<ServiceState, SupervisorError> {
        let handler = Arc::new(CommandHandler::new(RouteController::new()?));
        let adapter = ServiceAdapter::new(self.options.service_name.clone(), reporter);
        Ok(adapter.run(signals, &self.listener(), handler).await)
    }
}

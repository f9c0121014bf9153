//! Service lifecycle adapter
//!
//! Control signals arrive on an mpsc channel, fed by the platform's service
//! manager bridge (or by tests). Status goes out through a
//! [`StatusReporter`]. Stop and shutdown close the control listener before
//! `Stopped` is reported.
//!
//! A listener whose accept loop fails is reopened a few times. When it
//! cannot be brought back the service stops instead of reporting `Running`
//! without a control channel.

pub mod state;
#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod windows;

pub use state::{ControlSignal, ServiceState, ServiceStatus};

use crate::daemon::{ControlChannel, ListenerError, ListenerHandle, RequestHandler};
use state::{transition, Action};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to report status: {0}")]
    Report(String),
    #[error("Service dispatcher error: {0}")]
    Dispatcher(String),
}

/// Publishes status to whoever supervises this process.
pub trait StatusReporter: Send {
    fn report(&mut self, status: &ServiceStatus) -> Result<(), ServiceError>;
}

/// Reporter for interactive runs: status changes only go to the log.
#[derive(Debug, Default)]
pub struct LogReporter;

impl StatusReporter for LogReporter {
    fn report(&mut self, status: &ServiceStatus) -> Result<(), ServiceError> {
        info!("Service status: {}", status.state);
        Ok(())
    }
}

/// Times a failed control channel is reopened before the service gives up.
const LISTENER_RESTARTS: usize = 3;
const RESTART_DELAY: Duration = Duration::from_millis(200);

/// Whether the control loop keeps going after a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

pub struct ServiceAdapter<R> {
    name: String,
    state: ServiceState,
    reporter: R,
}

impl<R: StatusReporter> ServiceAdapter<R> {
    pub fn new(name: impl Into<String>, reporter: R) -> Self {
        Self {
            name: name.into(),
            state: ServiceState::NotStarted,
            reporter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    fn set_state(&mut self, state: ServiceState) {
        self.state = state;
        if let Err(e) = self.reporter.report(&ServiceStatus::new(state)) {
            warn!("{}: {}", self.name, e);
        }
    }

    /// Announce `Running` together with the accepted signals.
    pub fn start(&mut self) {
        info!("Service {} starting", self.name);
        self.set_state(ServiceState::Running);
    }

    pub fn handle(&mut self, signal: ControlSignal) -> Flow {
        let (next, action) = transition(self.state, signal);
        match action {
            Action::Report => {
                debug!("{:?}: {} -> {}", signal, self.state, next);
                self.set_state(next);
                Flow::Continue
            }
            Action::Stop => {
                info!("Service {} received {:?}", self.name, signal);
                self.set_state(next);
                Flow::Stop
            }
            Action::Ignore => {
                debug!("Ignoring {:?} in state {}", signal, self.state);
                Flow::Continue
            }
        }
    }

    /// Run the control loop until stop, shutdown, or the signal source goes
    /// away.
    ///
    /// A listener that fails to bind at startup is logged and the service
    /// keeps answering the service manager. One that fails later is
    /// reopened up to [`LISTENER_RESTARTS`] times; after that the service
    /// stops.
    pub async fn run<C: ControlChannel>(
        mut self,
        mut signals: mpsc::Receiver<ControlSignal>,
        listener: &C,
        handler: Arc<dyn RequestHandler>,
    ) -> ServiceState {
        self.start();

        let mut handle = match listener.start(Arc::clone(&handler)) {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Control channel unavailable: {}", e);
                None
            }
        };
        let mut restarts = 0;

        loop {
            tokio::select! {
                signal = signals.recv() => {
                    let signal = signal.unwrap_or_else(|| {
                        info!("Signal source closed, stopping");
                        ControlSignal::Stop
                    });
                    if self.handle(signal) == Flow::Stop {
                        break;
                    }
                }
                reason = listener_ended(&mut handle) => {
                    handle = None;
                    error!("Control channel failed: {}", reason);
                    if restarts == LISTENER_RESTARTS {
                        error!("Control channel failed {} times, stopping", restarts + 1);
                        self.set_state(ServiceState::Stopping);
                        break;
                    }
                    restarts += 1;
                    tokio::time::sleep(RESTART_DELAY).await;
                    match listener.start(Arc::clone(&handler)) {
                        Ok(reopened) => {
                            info!("Control channel reopened on {}", reopened.address());
                            handle = Some(reopened);
                        }
                        Err(e) => {
                            error!("Failed to reopen control channel: {}", e);
                            self.set_state(ServiceState::Stopping);
                            break;
                        }
                    }
                }
            }
        }

        if let Some(handle) = handle {
            handle.close();
            match handle.wait().await {
                ListenerError::Closed => debug!("Control channel closed"),
                other => warn!("Control channel ended with: {}", other),
            }
        }

        self.set_state(ServiceState::Stopped);
        info!("Service {} stopped", self.name);
        self.state
    }
}

/// Resolves when a running listener ends by itself; never without one.
async fn listener_ended(handle: &mut Option<ListenerHandle>) -> ListenerError {
    match handle {
        Some(handle) => handle.ended().await,
        None => std::future::pending().await,
    }
}

/// Signal source for foreground runs: Ctrl-C stops the service.
pub fn console_signals() -> mpsc::Receiver<ControlSignal> {
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(ControlSignal::Stop).await.is_err() {
                break;
            }
        }
    });
    rx
}

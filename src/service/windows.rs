//! Service control manager bridge

use super::{ControlSignal, ServiceError, ServiceState, ServiceStatus, StatusReporter};
use std::ffi::OsString;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use windows_service::service::{
    ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState as ScmState,
    ServiceStatus as ScmStatus, ServiceType,
};
use windows_service::service_control_handler::{
    self, ServiceControlHandlerResult, ServiceStatusHandle,
};
use windows_service::{define_windows_service, service_dispatcher};

type ServiceEntry = Box<dyn Fn(mpsc::Receiver<ControlSignal>, ScmReporter) + Send + Sync>;

static SERVICE_NAME: OnceLock<String> = OnceLock::new();
static SERVICE_ENTRY: OnceLock<ServiceEntry> = OnceLock::new();

define_windows_service!(ffi_service_main, service_main);

/// Hand the calling thread to the service control dispatcher.
///
/// `entry` runs on the dispatcher's service thread with the bridged signal
/// channel and a reporter bound to the registered status handle. Returns
/// once the service has stopped.
pub fn run_dispatcher<F>(name: &str, entry: F) -> Result<(), ServiceError>
where
    F: Fn(mpsc::Receiver<ControlSignal>, ScmReporter) + Send + Sync + 'static,
{
    if SERVICE_NAME.set(name.to_string()).is_err() || SERVICE_ENTRY.set(Box::new(entry)).is_err()
    {
        return Err(ServiceError::Dispatcher(
            "dispatcher already started".to_string(),
        ));
    }
    service_dispatcher::start(name, ffi_service_main)
        .map_err(|e| ServiceError::Dispatcher(e.to_string()))
}

fn service_main(_arguments: Vec<OsString>) {
    if let Err(e) = run_service() {
        error!("Service failed: {}", e);
    }
}

fn run_service() -> Result<(), ServiceError> {
    let (Some(name), Some(entry)) = (SERVICE_NAME.get(), SERVICE_ENTRY.get()) else {
        return Err(ServiceError::Dispatcher(
            "service entry not configured".to_string(),
        ));
    };

    let (tx, rx) = mpsc::channel(16);
    let handle = service_control_handler::register(name, move |control| {
        let signal = control_signal(control);
        // the SCM thread must not block
        if let Err(e) = tx.try_send(signal) {
            warn!("Dropping service control {:?}: {}", signal, e);
        }
        ServiceControlHandlerResult::NoError
    })
    .map_err(|e| ServiceError::Dispatcher(e.to_string()))?;

    info!("Registered service {}", name);
    entry(rx, ScmReporter { handle });
    Ok(())
}

pub fn control_signal(control: ServiceControl) -> ControlSignal {
    match control {
        ServiceControl::Stop => ControlSignal::Stop,
        ServiceControl::Shutdown => ControlSignal::Shutdown,
        ServiceControl::Pause => ControlSignal::Pause,
        ServiceControl::Continue => ControlSignal::Continue,
        ServiceControl::Interrogate => ControlSignal::Interrogate,
        other => ControlSignal::Other(other.raw_service_control_type()),
    }
}

pub struct ScmReporter {
    handle: ServiceStatusHandle,
}

fn scm_status(status: &ServiceStatus) -> ScmStatus {
    let current_state = match status.state {
        ServiceState::NotStarted => ScmState::StartPending,
        ServiceState::Running => ScmState::Running,
        ServiceState::Paused => ScmState::Paused,
        ServiceState::Stopping => ScmState::StopPending,
        ServiceState::Stopped => ScmState::Stopped,
    };

    let mut controls_accepted = ServiceControlAccept::empty();
    for signal in status.accepted {
        controls_accepted |= match signal {
            ControlSignal::Stop => ServiceControlAccept::STOP,
            ControlSignal::Shutdown => ServiceControlAccept::SHUTDOWN,
            ControlSignal::Pause | ControlSignal::Continue => ServiceControlAccept::PAUSE_CONTINUE,
            _ => ServiceControlAccept::empty(),
        };
    }

    ScmStatus {
        service_type: ServiceType::OWN_PROCESS,
        current_state,
        controls_accepted,
        exit_code: ServiceExitCode::Win32(0),
        checkpoint: 0,
        wait_hint: if status.state == ServiceState::Stopping {
            Duration::from_secs(10)
        } else {
            Duration::default()
        },
        process_id: None,
    }
}

impl StatusReporter for ScmReporter {
    fn report(&mut self, status: &ServiceStatus) -> Result<(), ServiceError> {
        info!("Service status: {}", status.state);
        self.handle
            .set_service_status(scm_status(status))
            .map_err(|e| ServiceError::Report(e.to_string()))
    }
}

//! POSIX signals in, systemd notifications out

use super::{ControlSignal, ServiceError, ServiceState, ServiceStatus, StatusReporter};
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Map process signals onto service control signals.
///
/// | signal  | control     |
/// |---------|-------------|
/// | SIGTERM | Stop        |
/// | SIGINT  | Shutdown    |
/// | SIGUSR1 | Pause       |
/// | SIGUSR2 | Continue    |
/// | SIGHUP  | Interrogate |
pub fn signal_channel() -> Result<mpsc::Receiver<ControlSignal>, ServiceError> {
    let table = [
        (SignalKind::terminate(), ControlSignal::Stop),
        (SignalKind::interrupt(), ControlSignal::Shutdown),
        (SignalKind::user_defined1(), ControlSignal::Pause),
        (SignalKind::user_defined2(), ControlSignal::Continue),
        (SignalKind::hangup(), ControlSignal::Interrogate),
    ];

    let (tx, rx) = mpsc::channel(16);
    for (kind, control) in table {
        let mut stream = signal(kind)?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                debug!("Received signal for {:?}", control);
                if tx.send(control).await.is_err() {
                    break;
                }
            }
        });
    }
    Ok(rx)
}

/// Reports to systemd through `NOTIFY_SOCKET` when it is set, and always
/// to the log.
#[derive(Debug, Default)]
pub struct SystemdReporter {
    socket: Option<PathBuf>,
}

impl SystemdReporter {
    pub fn from_env() -> Self {
        Self {
            socket: std::env::var_os("NOTIFY_SOCKET").map(PathBuf::from),
        }
    }

    pub fn with_socket(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: Some(socket.into()),
        }
    }

    fn send(&self, message: &str) -> Result<(), ServiceError> {
        let Some(path) = &self.socket else {
            return Ok(());
        };
        let sock = UnixDatagram::unbound()?;

        // abstract namespace socket
        #[cfg(target_os = "linux")]
        {
            if let Some(name) = path.to_str().and_then(|p| p.strip_prefix('@')) {
                use std::os::linux::net::SocketAddrExt;
                let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
                sock.send_to_addr(message.as_bytes(), &addr)?;
                return Ok(());
            }
        }

        sock.send_to(message.as_bytes(), path)?;
        Ok(())
    }
}

/// sd_notify payload for a state.
pub fn notify_message(state: ServiceState) -> &'static str {
    match state {
        ServiceState::NotStarted => "STATUS=Starting",
        ServiceState::Running => "READY=1\nSTATUS=Running",
        ServiceState::Paused => "STATUS=Paused",
        ServiceState::Stopping => "STOPPING=1\nSTATUS=Stopping",
        ServiceState::Stopped => "STATUS=Stopped",
    }
}

impl StatusReporter for SystemdReporter {
    fn report(&mut self, status: &ServiceStatus) -> Result<(), ServiceError> {
        info!("Service status: {}", status.state);
        self.send(notify_message(status.state))
            .map_err(|e| ServiceError::Report(e.to_string()))
    }
}

//! Platform-specific routing implementations
//!
//! Every back-end is a thin translation of routing primitives into the
//! platform's network configuration commands. All of them are compiled on
//! every target so their command lines can be unit tested anywhere; the one
//! matching the build target is picked by [`get_routing_manager`].

pub mod linux;
pub mod mac;
pub mod windows;

use crate::vpn::subnet::Subnet;
use std::io;
use std::net::IpAddr;
use std::process::Command;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("Failed to run `{command}`: {source}")]
    Spawn { command: String, source: io::Error },
    #[error("Failed to discover default gateway: {0}")]
    GatewayDiscovery(String),
    #[error("Unsupported address: {0}")]
    UnsupportedAddress(String),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Executes network configuration commands.
///
/// The supervisor already runs elevated, so commands are executed directly.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, returning stdout on success.
    fn run(&self, program: &str, args: &[&str]) -> Result<String, PlatformError>;
}

/// Runs commands as child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, PlatformError> {
        let command = command_line(program, args);
        debug!("Executing: {}", command);

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| PlatformError::Spawn {
                command: command.clone(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stderr = if stderr.is_empty() {
                // some tools (route.exe, netsh) report errors on stdout
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            } else {
                stderr
            };
            return Err(PlatformError::CommandFailed { command, stderr });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl<T: CommandRunner + ?Sized> CommandRunner for std::sync::Arc<T> {
    fn run(&self, program: &str, args: &[&str]) -> Result<String, PlatformError> {
        (**self).run(program, args)
    }
}

pub(crate) fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Platform-agnostic routing interface
pub trait RoutingManager: Send + Sync {
    /// Assign `subnet` to `interface` with `peer` as the point-to-point remote.
    fn assign_address(&self, interface: &str, subnet: &Subnet, peer: IpAddr)
        -> Result<(), PlatformError>;

    /// Current IPv4 default gateway.
    fn default_gateway(&self) -> Result<IpAddr, PlatformError>;

    fn add_route(&self, destination: &Subnet, gateway: IpAddr) -> Result<(), PlatformError>;

    fn delete_route(&self, destination: &Subnet) -> Result<(), PlatformError>;

    /// Route `destination` directly out of `interface`, without a gateway.
    fn add_interface_route(&self, destination: &Subnet, interface: &str)
        -> Result<(), PlatformError>;

    fn delete_interface_route(&self, destination: &Subnet, interface: &str)
        -> Result<(), PlatformError>;
}

/// Get the appropriate routing manager for the current platform
pub fn get_routing_manager() -> Result<Box<dyn RoutingManager>, PlatformError> {
    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(mac::MacRoutingManager::new()))
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::LinuxRoutingManager::new()))
    }

    #[cfg(target_os = "windows")]
    {
        Ok(Box::new(windows::WindowsRoutingManager::new()))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        Err(PlatformError::UnsupportedPlatform)
    }
}

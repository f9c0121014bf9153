//! Route table manipulation for the tunnel interface
//!
//! The controller keeps no record of what it changed; the OS routing table
//! is the only source of truth. Operations are expected in this order:
//!
//! 1. [`RouteController::assign_address`] on the freshly created interface
//! 2. [`RouteController::exclude_host`] for the VPN server endpoint
//! 3. [`RouteController::redirect_default_route`] into the tunnel
//!
//! Redirecting before excluding cuts the tunnel off from its own server.
//! The ordering is a caller contract and is not checked here.
//!
//! Each operation stops at the first failing command and does not undo the
//! commands that already succeeded.

use crate::platform::{get_routing_manager, PlatformError, RoutingManager};
use crate::vpn::subnet::{split_default_routes, Subnet};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Platform error: {0}")]
    PlatformError(#[from] PlatformError),
    #[error("Unsupported address: {0}")]
    UnsupportedAddress(String),
    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<RoutingError>,
    },
}

/// Steps of a full split-tunnel setup, in the order they must run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AssignAddress,
    ExcludeHost,
    RedirectDefaultRoute,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::AssignAddress => "address assignment",
            Stage::ExcludeHost => "host exclusion",
            Stage::RedirectDefaultRoute => "default route redirect",
        };
        f.write_str(name)
    }
}

pub struct RouteController {
    manager: Box<dyn RoutingManager>,
}

impl RouteController {
    /// Controller backed by the current platform's routing commands.
    pub fn new() -> Result<Self, RoutingError> {
        Ok(Self::with_manager(get_routing_manager()?))
    }

    pub fn with_manager(manager: Box<dyn RoutingManager>) -> Self {
        Self { manager }
    }

    /// Assign `subnet` to `interface` together with its derived peer address.
    ///
    /// Returns the peer address that was applied.
    pub fn assign_address(&self, interface: &str, subnet: &Subnet) -> Result<IpAddr, RoutingError> {
        let peer = subnet.peer();
        info!("Assigning {} (peer {}) to {}", subnet, peer, interface);
        self.manager.assign_address(interface, subnet, peer)?;
        Ok(peer)
    }

    /// Keep `address` reachable through the current default gateway.
    ///
    /// Returns the gateway the host route points to.
    pub fn exclude_host(&self, address: IpAddr) -> Result<IpAddr, RoutingError> {
        if !address.is_ipv4() {
            return Err(RoutingError::UnsupportedAddress(format!(
                "{} (host exclusion is IPv4 only)",
                address
            )));
        }
        let gateway = self.manager.default_gateway()?;
        info!("Excluding {} from tunnel via gateway {}", address, gateway);
        self.manager.add_route(&Subnet::host(address), gateway)?;
        Ok(gateway)
    }

    /// Route the whole IPv4 space through `interface` with two /1 routes.
    pub fn redirect_default_route(&self, interface: &str) -> Result<(), RoutingError> {
        for route in split_default_routes() {
            info!("Adding route {} via {}", route, interface);
            self.manager.add_interface_route(&route, interface)?;
        }
        Ok(())
    }

    /// Remove the host route installed by [`Self::exclude_host`].
    pub fn remove_excluded_host(&self, address: IpAddr) -> Result<(), RoutingError> {
        info!("Removing excluded host route for {}", address);
        self.manager.delete_route(&Subnet::host(address))?;
        Ok(())
    }

    /// Remove both halves installed by [`Self::redirect_default_route`].
    ///
    /// Both deletions are attempted; the first error is returned.
    pub fn restore_default_route(&self, interface: &str) -> Result<(), RoutingError> {
        let mut first_err = None;
        for route in split_default_routes() {
            info!("Removing route {} via {}", route, interface);
            if let Err(e) = self.manager.delete_interface_route(&route, interface) {
                warn!("Failed to remove route {}: {}", route, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Run all three steps in order: assign, exclude `server`, redirect.
    ///
    /// A failure reports which step broke. Earlier steps stay applied.
    pub fn split_tunnel(
        &self,
        interface: &str,
        subnet: &Subnet,
        server: IpAddr,
    ) -> Result<(), RoutingError> {
        let staged = |stage: Stage| move |e: RoutingError| RoutingError::Stage {
            stage,
            source: Box::new(e),
        };

        self.assign_address(interface, subnet)
            .map_err(staged(Stage::AssignAddress))?;
        self.exclude_host(server)
            .map_err(staged(Stage::ExcludeHost))?;
        self.redirect_default_route(interface)
            .map_err(staged(Stage::RedirectDefaultRoute))?;
        Ok(())
    }
}

//! macOS-specific routing implementation

use super::{CommandRunner, PlatformError, RoutingManager, SystemCommandRunner};
use crate::vpn::subnet::Subnet;
use std::net::{IpAddr, Ipv4Addr};

pub struct MacRoutingManager<R = SystemCommandRunner> {
    runner: R,
}

impl MacRoutingManager {
    pub fn new() -> Self {
        Self::with_runner(SystemCommandRunner)
    }
}

impl Default for MacRoutingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> MacRoutingManager<R> {
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }
}

/// `-host ADDR` for single addresses, `-net CIDR` otherwise.
fn destination_args(destination: &Subnet) -> (&'static str, String) {
    if Subnet::host(destination.addr()) == *destination {
        ("-host", destination.addr().to_string())
    } else {
        ("-net", destination.to_string())
    }
}

impl<R: CommandRunner> RoutingManager for MacRoutingManager<R> {
    fn assign_address(
        &self,
        interface: &str,
        subnet: &Subnet,
        peer: IpAddr,
    ) -> Result<(), PlatformError> {
        let local = subnet.to_string();
        let peer = peer.to_string();
        if subnet.is_ipv4() {
            self.runner.run("ifconfig", &[interface, &local, &peer])?;
        } else {
            self.runner
                .run("ifconfig", &[interface, "inet6", &local, &peer])?;
        }
        Ok(())
    }

    fn default_gateway(&self) -> Result<IpAddr, PlatformError> {
        let output = self.runner.run("route", &["-n", "get", "default"])?;
        parse_default_gateway(&output).map(IpAddr::V4).ok_or_else(|| {
            PlatformError::GatewayDiscovery("no gateway in `route get` output".to_string())
        })
    }

    fn add_route(&self, destination: &Subnet, gateway: IpAddr) -> Result<(), PlatformError> {
        let (kind, dest) = destination_args(destination);
        let gateway = gateway.to_string();
        self.runner
            .run("route", &["-n", "add", kind, &dest, &gateway])?;
        Ok(())
    }

    fn delete_route(&self, destination: &Subnet) -> Result<(), PlatformError> {
        let (kind, dest) = destination_args(destination);
        self.runner.run("route", &["-n", "delete", kind, &dest])?;
        Ok(())
    }

    fn add_interface_route(
        &self,
        destination: &Subnet,
        interface: &str,
    ) -> Result<(), PlatformError> {
        let (kind, dest) = destination_args(destination);
        self.runner
            .run("route", &["-n", "add", kind, &dest, "-interface", interface])?;
        Ok(())
    }

    fn delete_interface_route(
        &self,
        destination: &Subnet,
        interface: &str,
    ) -> Result<(), PlatformError> {
        let (kind, dest) = destination_args(destination);
        self.runner.run(
            "route",
            &["-n", "delete", kind, &dest, "-interface", interface],
        )?;
        Ok(())
    }
}

/// Extract the gateway from `route -n get default` output.
///
/// ```text
///    route to: default
/// destination: default
///        mask: default
///     gateway: 192.168.1.1
///   interface: en0
/// ```
pub fn parse_default_gateway(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() == "gateway" {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

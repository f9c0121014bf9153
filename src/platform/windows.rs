//! Windows-specific routing implementation (route.exe and netsh)

use super::{CommandRunner, PlatformError, RoutingManager, SystemCommandRunner};
use crate::vpn::subnet::Subnet;
use std::net::{IpAddr, Ipv4Addr};

pub struct WindowsRoutingManager<R = SystemCommandRunner> {
    runner: R,
}

impl WindowsRoutingManager {
    pub fn new() -> Self {
        Self::with_runner(SystemCommandRunner)
    }
}

impl Default for WindowsRoutingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> WindowsRoutingManager<R> {
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }
}

fn ipv4_mask(subnet: &Subnet) -> Result<Ipv4Addr, PlatformError> {
    subnet
        .netmask()
        .ok_or_else(|| PlatformError::UnsupportedAddress(format!("{} is not IPv4", subnet)))
}

impl<R: CommandRunner> RoutingManager for WindowsRoutingManager<R> {
    /// Wintun adapters have no point-to-point peer, so `peer` is not applied
    /// as a gateway; doing so would install a default route via the tunnel.
    fn assign_address(
        &self,
        interface: &str,
        subnet: &Subnet,
        _peer: IpAddr,
    ) -> Result<(), PlatformError> {
        let name = format!("name={}", interface);
        if subnet.is_ipv4() {
            let address = format!("address={}", subnet.addr());
            let mask = format!("mask={}", ipv4_mask(subnet)?);
            self.runner.run(
                "netsh",
                &[
                    "interface",
                    "ipv4",
                    "set",
                    "address",
                    &name,
                    "source=static",
                    &address,
                    &mask,
                    "gateway=none",
                ],
            )?;
        } else {
            let iface = format!("interface={}", interface);
            let address = format!("address={}", subnet);
            self.runner.run(
                "netsh",
                &["interface", "ipv6", "add", "address", &iface, &address],
            )?;
        }
        Ok(())
    }

    fn default_gateway(&self) -> Result<IpAddr, PlatformError> {
        let output = self.runner.run("route", &["print", "-4", "0.0.0.0"])?;
        parse_default_gateway(&output).map(IpAddr::V4).ok_or_else(|| {
            PlatformError::GatewayDiscovery("no default route in `route print` output".to_string())
        })
    }

    fn add_route(&self, destination: &Subnet, gateway: IpAddr) -> Result<(), PlatformError> {
        let dest = destination.addr().to_string();
        let mask = ipv4_mask(destination)?.to_string();
        let gateway = gateway.to_string();
        self.runner
            .run("route", &["add", &dest, "mask", &mask, &gateway])?;
        Ok(())
    }

    fn delete_route(&self, destination: &Subnet) -> Result<(), PlatformError> {
        let dest = destination.addr().to_string();
        let mask = ipv4_mask(destination)?.to_string();
        self.runner.run("route", &["delete", &dest, "mask", &mask])?;
        Ok(())
    }

    fn add_interface_route(
        &self,
        destination: &Subnet,
        interface: &str,
    ) -> Result<(), PlatformError> {
        let prefix = format!("prefix={}", destination);
        let iface = format!("interface={}", interface);
        self.runner.run(
            "netsh",
            &["interface", "ipv4", "add", "route", &prefix, &iface, "store=active"],
        )?;
        Ok(())
    }

    fn delete_interface_route(
        &self,
        destination: &Subnet,
        interface: &str,
    ) -> Result<(), PlatformError> {
        let prefix = format!("prefix={}", destination);
        let iface = format!("interface={}", interface);
        self.runner.run(
            "netsh",
            &["interface", "ipv4", "delete", "route", &prefix, &iface],
        )?;
        Ok(())
    }
}

/// Extract the gateway from the active routes of `route print -4 0.0.0.0`:
///
/// ```text
/// Network Destination        Netmask          Gateway       Interface  Metric
///           0.0.0.0          0.0.0.0      192.168.1.1    192.168.1.100     25
/// ```
pub fn parse_default_gateway(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let columns: Vec<&str> = line.split_whitespace().collect();
        match columns.as_slice() {
            ["0.0.0.0", "0.0.0.0", gateway, _, _] => gateway.parse().ok(),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::RecordingRunner;
    use std::sync::Arc;

    const ROUTE_PRINT_OUTPUT: &str = "===========================================================================
Interface List
 12...00 15 5d 01 02 03 ......Microsoft Hyper-V Network Adapter
===========================================================================

IPv4 Route Table
===========================================================================
Active Routes:
Network Destination        Netmask          Gateway       Interface  Metric
          0.0.0.0          0.0.0.0      192.168.1.1    192.168.1.100     25
===========================================================================
Persistent Routes:
  None
";

    fn manager(runner: &Arc<RecordingRunner>) -> WindowsRoutingManager<Arc<RecordingRunner>> {
        WindowsRoutingManager::with_runner(Arc::clone(runner))
    }

    #[test]
    fn test_windows_routing_manager_creation() {
        let _manager = WindowsRoutingManager::new();
        let _default = WindowsRoutingManager::default();
    }

    #[test]
    fn test_parse_default_gateway() {
        assert_eq!(
            parse_default_gateway(ROUTE_PRINT_OUTPUT),
            Some(Ipv4Addr::new(192, 168, 1, 1))
        );
        assert_eq!(
            parse_default_gateway("          0.0.0.0          0.0.0.0         On-link     10.8.0.2    5"),
            None
        );
    }

    #[test]
    fn test_assign_address_commands() {
        let runner = Arc::new(RecordingRunner::new());
        let subnet: Subnet = "10.8.0.1/24".parse().unwrap();

        manager(&runner)
            .assign_address("myst0", &subnet, subnet.peer())
            .unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "netsh interface ipv4 set address name=myst0 source=static address=10.8.0.1 mask=255.255.255.0 gateway=none"
            ]
        );
    }

    #[test]
    fn test_route_commands() {
        let runner = Arc::new(RecordingRunner::new().respond(Ok(ROUTE_PRINT_OUTPUT)));
        let mgr = manager(&runner);
        let host = Subnet::host("203.0.113.7".parse().unwrap());
        let half: Subnet = "0.0.0.0/1".parse().unwrap();

        let gateway = mgr.default_gateway().unwrap();
        mgr.add_route(&host, gateway).unwrap();
        mgr.delete_route(&host).unwrap();
        mgr.add_interface_route(&half, "myst0").unwrap();
        mgr.delete_interface_route(&half, "myst0").unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "route print -4 0.0.0.0",
                "route add 203.0.113.7 mask 255.255.255.255 192.168.1.1",
                "route delete 203.0.113.7 mask 255.255.255.255",
                "netsh interface ipv4 add route prefix=0.0.0.0/1 interface=myst0 store=active",
                "netsh interface ipv4 delete route prefix=0.0.0.0/1 interface=myst0",
            ]
        );
    }

    #[test]
    fn test_ipv6_host_route_is_unsupported() {
        let runner = Arc::new(RecordingRunner::new());
        let host = Subnet::host("2001:db8::1".parse().unwrap());

        let result = manager(&runner).add_route(&host, "192.168.1.1".parse().unwrap());

        assert!(matches!(result, Err(PlatformError::UnsupportedAddress(_))));
        assert!(runner.calls().is_empty());
    }
}

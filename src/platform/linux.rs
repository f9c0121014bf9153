//! Linux-specific routing implementation (iproute2)

use super::{CommandRunner, PlatformError, RoutingManager, SystemCommandRunner};
use crate::vpn::subnet::Subnet;
use std::net::{IpAddr, Ipv4Addr};

pub struct LinuxRoutingManager<R = SystemCommandRunner> {
    runner: R,
}

impl LinuxRoutingManager {
    pub fn new() -> Self {
        Self::with_runner(SystemCommandRunner)
    }
}

impl Default for LinuxRoutingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> LinuxRoutingManager<R> {
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> RoutingManager for LinuxRoutingManager<R> {
    fn assign_address(
        &self,
        interface: &str,
        subnet: &Subnet,
        peer: IpAddr,
    ) -> Result<(), PlatformError> {
        // With a peer, iproute2 wants the prefix on the peer side.
        let local = subnet.addr().to_string();
        let peer = Subnet::new(peer, subnet.prefix())
            .map_err(|e| PlatformError::UnsupportedAddress(e.to_string()))?
            .to_string();
        self.runner.run(
            "ip",
            &["address", "add", &local, "peer", &peer, "dev", interface],
        )?;
        self.runner
            .run("ip", &["link", "set", "dev", interface, "up"])?;
        Ok(())
    }

    fn default_gateway(&self) -> Result<IpAddr, PlatformError> {
        let output = self.runner.run("ip", &["-4", "route", "show", "default"])?;
        parse_default_gateway(&output).map(IpAddr::V4).ok_or_else(|| {
            PlatformError::GatewayDiscovery("no default route in `ip route` output".to_string())
        })
    }

    fn add_route(&self, destination: &Subnet, gateway: IpAddr) -> Result<(), PlatformError> {
        let dest = destination.to_string();
        let gateway = gateway.to_string();
        self.runner
            .run("ip", &["route", "add", &dest, "via", &gateway])?;
        Ok(())
    }

    fn delete_route(&self, destination: &Subnet) -> Result<(), PlatformError> {
        let dest = destination.to_string();
        self.runner.run("ip", &["route", "delete", &dest])?;
        Ok(())
    }

    fn add_interface_route(
        &self,
        destination: &Subnet,
        interface: &str,
    ) -> Result<(), PlatformError> {
        let dest = destination.to_string();
        self.runner
            .run("ip", &["route", "add", &dest, "dev", interface])?;
        Ok(())
    }

    fn delete_interface_route(
        &self,
        destination: &Subnet,
        interface: &str,
    ) -> Result<(), PlatformError> {
        let dest = destination.to_string();
        self.runner
            .run("ip", &["route", "delete", &dest, "dev", interface])?;
        Ok(())
    }
}

/// Extract the gateway from `ip -4 route show default` output, e.g.
/// `default via 192.168.1.1 dev wlan0 proto dhcp metric 600`.
pub fn parse_default_gateway(output: &str) -> Option<Ipv4Addr> {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with("default"))
        .find_map(|line| {
            let mut tokens = line.split_whitespace();
            tokens.find(|t| *t == "via")?;
            tokens.next()?.parse().ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::RecordingRunner;
    use std::sync::Arc;

    fn manager(runner: &Arc<RecordingRunner>) -> LinuxRoutingManager<Arc<RecordingRunner>> {
        LinuxRoutingManager::with_runner(Arc::clone(runner))
    }

    #[test]
    fn test_linux_routing_manager_creation() {
        let _manager = LinuxRoutingManager::new();
        let _default = LinuxRoutingManager::default();
    }

    #[test]
    fn test_assign_address_commands() {
        let runner = Arc::new(RecordingRunner::new());
        let subnet: Subnet = "10.8.0.1/24".parse().unwrap();

        manager(&runner)
            .assign_address("tun0", &subnet, subnet.peer())
            .unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "ip address add 10.8.0.1 peer 10.8.0.2/24 dev tun0",
                "ip link set dev tun0 up",
            ]
        );
    }

    #[test]
    fn test_assign_address_stops_at_first_failure() {
        let runner = Arc::new(RecordingRunner::new().respond(Err("Cannot find device \"tun9\"")));
        let subnet: Subnet = "10.8.0.1/24".parse().unwrap();

        let result = manager(&runner).assign_address("tun9", &subnet, subnet.peer());

        assert!(matches!(result, Err(PlatformError::CommandFailed { .. })));
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn test_default_gateway() {
        let runner = Arc::new(
            RecordingRunner::new()
                .respond(Ok("default via 192.168.1.1 dev wlan0 proto dhcp metric 600\n")),
        );

        let gateway = manager(&runner).default_gateway().unwrap();

        assert_eq!(gateway, "192.168.1.1".parse::<IpAddr>().unwrap());
        assert_eq!(runner.calls(), vec!["ip -4 route show default"]);
    }

    #[test]
    fn test_default_gateway_missing() {
        let runner = Arc::new(RecordingRunner::new().respond(Ok("")));

        let result = manager(&runner).default_gateway();
        assert!(matches!(result, Err(PlatformError::GatewayDiscovery(_))));
    }

    #[test]
    fn test_parse_default_gateway() {
        assert_eq!(
            parse_default_gateway("default via 10.0.0.1 dev eth0\n"),
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );
        // point-to-point default without a gateway is skipped
        assert_eq!(
            parse_default_gateway(
                "default dev wg0 scope link\ndefault via 172.16.0.1 dev eth0 metric 100\n"
            ),
            Some(Ipv4Addr::new(172, 16, 0, 1))
        );
        assert_eq!(parse_default_gateway("10.0.0.0/8 via 10.0.0.1 dev eth0"), None);
        assert_eq!(parse_default_gateway("default via garbage dev eth0"), None);
    }

    #[test]
    fn test_route_commands() {
        let runner = Arc::new(RecordingRunner::new());
        let mgr = manager(&runner);
        let host = Subnet::host("203.0.113.7".parse().unwrap());
        let half: Subnet = "0.0.0.0/1".parse().unwrap();

        mgr.add_route(&host, "192.168.1.1".parse().unwrap()).unwrap();
        mgr.delete_route(&host).unwrap();
        mgr.add_interface_route(&half, "tun0").unwrap();
        mgr.delete_interface_route(&half, "tun0").unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "ip route add 203.0.113.7/32 via 192.168.1.1",
                "ip route delete 203.0.113.7/32",
                "ip route add 0.0.0.0/1 dev tun0",
                "ip route delete 0.0.0.0/1 dev tun0",
            ]
        );
    }
}

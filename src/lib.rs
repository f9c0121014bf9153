//! Myst Supervisor - privileged helper for VPN interface and route setup
//!
//! Runs as an OS-managed service with elevated rights and exposes one
//! access-controlled local channel. An unprivileged client asks over that
//! channel for the operations it cannot perform itself: assigning the tunnel
//! interface address, keeping the VPN server reachable through the original
//! gateway, and splitting the default route into the tunnel.
//!
//! # Architecture
//!
//! - `config`: Persisted record locating the managed binaries (TOML)
//! - `platform`: Routing commands per OS (macOS, Linux, Windows)
//! - `vpn`: Subnet values and the route controller
//! - `transport`: Named local endpoint with its ACL
//! - `daemon`: Accept loop and the default JSON command handler
//! - `service`: Service manager lifecycle and status reporting
//! - `session`: Session teardown messages
//! - `supervisor`: Wiring of all of the above
//!
//! # Usage
//!
//! ```bash
//! sudo myst-supervisor run --allow-group vpn
//! ```

pub mod config;
pub mod daemon;
pub mod platform;
pub mod service;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod vpn;

pub use config::Config;
pub use daemon::{
    ControlChannel, ControlListener, ListenerError, ListenerHandle, RequestHandler,
};
pub use service::{ControlSignal, ServiceAdapter, ServiceState};
pub use supervisor::{Supervisor, SupervisorOptions};
pub use transport::{AccessControl, Endpoint};
pub use vpn::routing::RouteController;

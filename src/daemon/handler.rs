//! Default request handler: JSON commands mapped onto the route controller

use super::listener::{HandlerFuture, RequestHandler};
use super::protocol::{read_request, write_response, ProtocolError, Request, Response};
use crate::transport::Connection;
use crate::vpn::routing::{RouteController, RoutingError};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, warn};

pub struct CommandHandler {
    controller: Arc<RouteController>,
}

impl CommandHandler {
    pub fn new(controller: RouteController) -> Self {
        Self {
            controller: Arc::new(controller),
        }
    }

    /// Answer requests on `stream` until the client hangs up.
    ///
    /// A malformed request gets an error response and the session goes on;
    /// an oversized one ends it.
    pub async fn serve<S>(&self, stream: &mut S) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);
        loop {
            let response = match read_request(&mut stream).await {
                Ok(Some(request)) => {
                    debug!("Request: {:?}", request);
                    self.dispatch(request).await
                }
                Ok(None) => return Ok(()),
                Err(ProtocolError::Malformed(e)) => {
                    Response::failure(format!("malformed request: {}", e))
                }
                Err(e) => {
                    let reply = Response::failure(e.to_string());
                    let _ = write_response(stream.get_mut(), &reply).await;
                    return Err(e);
                }
            };
            write_response(stream.get_mut(), &response).await?;
        }
    }

    async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::success(Some("pong".to_string())),
            Request::Version => Response::success(Some(env!("CARGO_PKG_VERSION").to_string())),
            Request::AssignIp { interface, subnet } => {
                self.run_blocking(move |c| {
                    c.assign_address(&interface, &subnet)
                        .map(|peer| Some(peer.to_string()))
                })
                .await
            }
            Request::ExcludeRoute { ip } => {
                self.run_blocking(move |c| c.exclude_host(ip).map(|gw| Some(gw.to_string())))
                    .await
            }
            Request::DefaultRoute { interface } => {
                self.run_blocking(move |c| c.redirect_default_route(&interface).map(|_| None))
                    .await
            }
            Request::RemoveExcludedRoute { ip } => {
                self.run_blocking(move |c| c.remove_excluded_host(ip).map(|_| None))
                    .await
            }
            Request::RestoreDefaultRoute { interface } => {
                self.run_blocking(move |c| c.restore_default_route(&interface).map(|_| None))
                    .await
            }
            Request::SplitTunnel {
                interface,
                subnet,
                server,
            } => {
                self.run_blocking(move |c| {
                    c.split_tunnel(&interface, &subnet, server).map(|_| None)
                })
                .await
            }
        }
    }

    /// Route commands spawn processes, so they run on the blocking pool.
    async fn run_blocking<F>(&self, op: F) -> Response
    where
        F: FnOnce(&RouteController) -> Result<Option<String>, RoutingError> + Send + 'static,
    {
        let controller = Arc::clone(&self.controller);
        match tokio::task::spawn_blocking(move || op(&controller)).await {
            Ok(Ok(data)) => Response::success(data),
            Ok(Err(e)) => {
                warn!("Route operation failed: {}", e);
                Response::failure(e.to_string())
            }
            Err(e) => Response::failure(format!("route operation aborted: {}", e)),
        }
    }
}

impl RequestHandler for CommandHandler {
    fn handle<'a>(&'a self, conn: &'a mut Connection) -> HandlerFuture<'a> {
        Box::pin(async move {
            self.serve(conn).await?;
            Ok(())
        })
    }
}

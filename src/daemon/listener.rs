//! Control channel accept loop
//!
//! The listener owns the endpoint and nothing else. Every accepted
//! connection runs in its own task, so a stalled client only stalls itself.
//! The handler sees a raw byte stream; message content is its business.

use crate::transport::{
    AccessControl, Connection, Endpoint, Incoming, PlatformListener, TransportError,
};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Failed to bind control channel: {0}")]
    Bind(#[from] TransportError),
    #[error("Accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("Listener closed")]
    Closed,
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Serves one client connection.
///
/// The listener closes the connection after the future resolves, whatever
/// the outcome.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle<'a>(&'a self, conn: &'a mut Connection) -> HandlerFuture<'a>;
}

/// Pause after the process or system runs out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Source of clients for the accept loop.
pub(crate) trait Acceptor: Send + 'static {
    fn accept(&mut self) -> impl Future<Output = io::Result<Incoming>> + Send;
    fn address(&self) -> String;
}

impl Acceptor for PlatformListener {
    fn accept(&mut self) -> impl Future<Output = io::Result<Incoming>> + Send {
        PlatformListener::accept(self)
    }

    fn address(&self) -> String {
        PlatformListener::address(self)
    }
}

/// Something the service can (re)open as its control channel.
pub trait ControlChannel: Send + Sync {
    fn start(&self, handler: Arc<dyn RequestHandler>) -> Result<ListenerHandle, ListenerError>;
}

pub struct ControlListener {
    endpoint: Endpoint,
    acl: AccessControl,
}

impl ControlListener {
    pub fn new(endpoint: Endpoint, acl: AccessControl) -> Self {
        Self { endpoint, acl }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn acl(&self) -> &AccessControl {
        &self.acl
    }

    /// Bind the endpoint and run the accept loop in the background.
    ///
    /// Must be called from within a tokio runtime. Bind failures are
    /// returned here; everything after that is reported by
    /// [`ListenerHandle::wait`].
    pub fn start(&self, handler: Arc<dyn RequestHandler>) -> Result<ListenerHandle, ListenerError> {
        let transport = PlatformListener::bind(&self.endpoint, &self.acl)?;
        Ok(spawn_accept_loop(transport, handler))
    }
}

impl ControlChannel for ControlListener {
    fn start(&self, handler: Arc<dyn RequestHandler>) -> Result<ListenerHandle, ListenerError> {
        ControlListener::start(self, handler)
    }
}

pub(crate) fn spawn_accept_loop<A: Acceptor>(
    acceptor: A,
    handler: Arc<dyn RequestHandler>,
) -> ListenerHandle {
    let address = acceptor.address();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let active = Arc::new(AtomicUsize::new(0));

    let task = tokio::spawn(accept_loop(
        acceptor,
        handler,
        shutdown_rx,
        Arc::clone(&active),
    ));

    ListenerHandle {
        shutdown,
        task,
        active,
        address,
    }
}

/// Running listener. Dropping the handle closes it.
pub struct ListenerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<ListenerError>,
    active: Arc<AtomicUsize>,
    address: String,
}

impl ListenerHandle {
    /// Stop accepting and cancel in-flight connections at their next await.
    pub fn close(&self) {
        // no receivers left means the loop already ended
        let _ = self.shutdown.send(true);
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connections whose handler has not finished yet.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Resolves when the accept loop ends on its own, without consuming
    /// the handle. Must not be awaited again once it has resolved.
    pub async fn ended(&mut self) -> ListenerError {
        join_reason((&mut self.task).await)
    }

    /// Wait for the accept loop to end and return why it ended.
    pub async fn wait(self) -> ListenerError {
        let ListenerHandle {
            shutdown: _shutdown,
            task,
            ..
        } = self;
        join_reason(task.await)
    }
}

fn join_reason(joined: Result<ListenerError, tokio::task::JoinError>) -> ListenerError {
    match joined {
        Ok(reason) => reason,
        Err(e) => ListenerError::Accept(io::Error::other(e)),
    }
}

/// Per-connection failures that do not affect the endpoint.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::PermissionDenied
    ) || is_resource_exhausted(e)
}

/// Out of descriptors or buffer space. Clears once clients disconnect.
#[cfg(unix)]
fn is_resource_exhausted(e: &io::Error) -> bool {
    use nix::errno::Errno;

    matches!(
        e.raw_os_error().map(Errno::from_raw),
        Some(Errno::EMFILE | Errno::ENFILE | Errno::ENOBUFS | Errno::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhausted(_e: &io::Error) -> bool {
    false
}

/// Resolves once the listener is closed or its handle is gone.
async fn closed(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

async fn accept_loop<A: Acceptor>(
    mut transport: A,
    handler: Arc<dyn RequestHandler>,
    mut shutdown: watch::Receiver<bool>,
    active: Arc<AtomicUsize>,
) -> ListenerError {
    info!("Waiting for connections on {}", transport.address());
    loop {
        let accepted = tokio::select! {
            result = transport.accept() => result,
            _ = closed(&mut shutdown) => {
                info!("Listener on {} closed", transport.address());
                return ListenerError::Closed;
            }
        };

        match accepted {
            Ok(incoming) => {
                tokio::spawn(serve_connection(
                    incoming,
                    Arc::clone(&handler),
                    shutdown.clone(),
                    Arc::clone(&active),
                ));
            }
            Err(e) if is_resource_exhausted(&e) => {
                warn!("Failed to accept connection: {}; retrying in {:?}", e, ACCEPT_BACKOFF);
                tokio::select! {
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    _ = closed(&mut shutdown) => {
                        info!("Listener on {} closed", transport.address());
                        return ListenerError::Closed;
                    }
                }
            }
            Err(e) if is_transient(&e) => warn!("Failed to accept connection: {}", e),
            Err(e) => {
                error!("Accept loop terminated: {}", e);
                return ListenerError::Accept(e);
            }
        }
    }
}

async fn serve_connection(
    incoming: Incoming,
    handler: Arc<dyn RequestHandler>,
    mut shutdown: watch::Receiver<bool>,
    active: Arc<AtomicUsize>,
) {
    // A peer that hung up or is outside the ACL only loses its own
    // connection.
    let conn = match incoming.admit().await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("Rejected client: {}", e);
            return;
        }
    };
    let peer = conn.peer().to_string();
    active.fetch_add(1, Ordering::SeqCst);
    info!("Client connected: {}", peer);

    // The handler runs in its own task so a panic drops the connection
    // there instead of unwinding through this one.
    let mut work = tokio::spawn(async move {
        let mut conn = conn;
        let result = handler.handle(&mut conn).await;
        (result, conn)
    });

    tokio::select! {
        joined = &mut work => match joined {
            Ok((result, mut conn)) => {
                if let Err(e) = result {
                    warn!("Handler failed for {}: {}", peer, e);
                }
                if let Err(e) = conn.shutdown().await {
                    debug!("Failed to close connection {}: {}", peer, e);
                }
            }
            Err(e) if e.is_panic() => error!("Handler panicked for {}", peer),
            Err(e) => debug!("Handler for {} cancelled: {}", peer, e),
        },
        _ = closed(&mut shutdown) => {
            work.abort();
            // the connection is dropped once the aborted task completes
            match work.await {
                Err(e) if e.is_panic() => error!("Handler panicked for {}", peer),
                _ => debug!("Dropped {} on listener shutdown", peer),
            }
        }
    }

    active.fetch_sub(1, Ordering::SeqCst);
    info!("Client disconnected: {}", peer);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use std::collections::VecDeque;
    use std::time::Instant;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
    use tokio::net::UnixStream;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Reads one line and acts on it: `block`, `linger`, `panic`, `fail`,
    /// or echo.
    struct LineHandler;

    /// Holds up the task that drops it.
    struct SlowDrop;

    impl Drop for SlowDrop {
        fn drop(&mut self) {
            std::thread::sleep(Duration::from_millis(300));
        }
    }

    /// Fails with each scripted error in turn, then waits forever.
    struct ScriptedAcceptor {
        errors: VecDeque<io::Error>,
    }

    impl Acceptor for ScriptedAcceptor {
        fn accept(&mut self) -> impl Future<Output = io::Result<Incoming>> + Send {
            let next = self.errors.pop_front();
            async move {
                match next {
                    Some(e) => Err(e),
                    None => std::future::pending().await,
                }
            }
        }

        fn address(&self) -> String {
            "scripted".to_string()
        }
    }

    fn scripted(errors: Vec<io::Error>) -> ScriptedAcceptor {
        ScriptedAcceptor {
            errors: errors.into(),
        }
    }

    fn exhausted() -> io::Error {
        io::Error::from_raw_os_error(Errno::EMFILE as i32)
    }

    impl RequestHandler for LineHandler {
        fn handle<'a>(&'a self, conn: &'a mut Connection) -> HandlerFuture<'a> {
            Box::pin(async move {
                let mut reader = BufReader::new(conn);
                let mut line = String::new();
                reader.read_line(&mut line).await?;
                match line.trim() {
                    "block" => std::future::pending::<()>().await,
                    "linger" => {
                        let _guard = SlowDrop;
                        std::future::pending::<()>().await
                    }
                    "panic" => panic!("handler panic"),
                    "fail" => return Err("handler failure".into()),
                    other => {
                        let reply = format!("echo {}\n", other);
                        reader.get_mut().write_all(reply.as_bytes()).await?;
                    }
                }
                Ok(())
            })
        }
    }

    fn listener(dir: &TempDir) -> ControlListener {
        let path = dir.path().join("control.sock");
        ControlListener::new(
            Endpoint::new(path.display().to_string()),
            AccessControl::unrestricted(),
        )
    }

    async fn send(listener: &ControlListener, line: &str) -> UnixStream {
        let mut stream = UnixStream::connect(listener.endpoint().socket_path())
            .await
            .unwrap();
        stream.write_all(line.as_bytes()).await.unwrap();
        stream
    }

    async fn read_all(stream: &mut UnixStream) -> String {
        let mut out = String::new();
        timeout(WAIT, stream.read_to_string(&mut out))
            .await
            .expect("connection was not closed")
            .unwrap();
        out
    }

    #[test]
    fn test_listener_error_display() {
        assert_eq!(ListenerError::Closed.to_string(), "Listener closed");
        let err = ListenerError::Bind(TransportError::InUse("/x.sock".to_string()));
        assert_eq!(
            err.to_string(),
            "Failed to bind control channel: Endpoint /x.sock is already in use"
        );
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(is_transient(&exhausted()));
        assert!(is_transient(&io::Error::from_raw_os_error(Errno::ENFILE as i32)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::Other)));
        assert!(!is_transient(&io::Error::from_raw_os_error(Errno::EBADF as i32)));
    }

    #[tokio::test]
    async fn test_fatal_accept_error_ends_loop() {
        let started = Instant::now();
        let handle = spawn_accept_loop(
            scripted(vec![
                exhausted(),
                io::Error::from(io::ErrorKind::ConnectionReset),
                io::Error::other("listening socket lost"),
            ]),
            Arc::new(LineHandler),
        );

        let reason = timeout(WAIT, handle.wait()).await.unwrap();

        match reason {
            ListenerError::Accept(e) => assert_eq!(e.to_string(), "listening socket lost"),
            other => panic!("Expected Accept error, got {}", other),
        }
        assert!(started.elapsed() >= ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn test_descriptor_exhaustion_keeps_loop_alive() {
        let handle = spawn_accept_loop(
            scripted(vec![exhausted(), exhausted(), exhausted()]),
            Arc::new(LineHandler),
        );

        tokio::time::sleep(ACCEPT_BACKOFF * 5).await;
        assert!(!handle.is_finished());

        handle.close();
        let reason = timeout(WAIT, handle.wait()).await.unwrap();
        assert!(matches!(reason, ListenerError::Closed));
    }

    #[tokio::test]
    async fn test_ended_reports_loop_failure() {
        let mut handle = spawn_accept_loop(
            scripted(vec![io::Error::other("listening socket lost")]),
            Arc::new(LineHandler),
        );

        let reason = timeout(WAIT, handle.ended()).await.unwrap();
        assert!(matches!(reason, ListenerError::Accept(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_handles_many_concurrent_connections() {
        let dir = TempDir::new().unwrap();
        let listener = listener(&dir);
        let handle = listener.start(Arc::new(LineHandler)).unwrap();

        let mut clients = Vec::new();
        for i in 0..50 {
            clients.push(send(&listener, &format!("client-{}\n", i)).await);
        }

        let replies = collect_replies(clients).await;
        for (i, reply) in replies.iter().enumerate() {
            assert_eq!(reply, &format!("echo client-{}\n", i));
        }

        handle.close();
    }

    async fn collect_replies(clients: Vec<UnixStream>) -> Vec<String> {
        let tasks: Vec<_> = clients
            .into_iter()
            .map(|mut c| tokio::spawn(async move { read_all(&mut c).await }))
            .collect();
        let mut replies = Vec::new();
        for task in tasks {
            replies.push(task.await.unwrap());
        }
        replies
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_blocked_handler_does_not_delay_others() {
        let dir = TempDir::new().unwrap();
        let listener = listener(&dir);
        let handle = listener.start(Arc::new(LineHandler)).unwrap();

        let _blocked = send(&listener, "block\n").await;
        let mut other = send(&listener, "hello\n").await;

        assert_eq!(read_all(&mut other).await, "echo hello\n");
        assert!(handle.active_connections() >= 1);

        handle.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_ends_loop_with_closed() {
        let dir = TempDir::new().unwrap();
        let listener = listener(&dir);
        let handle = listener.start(Arc::new(LineHandler)).unwrap();

        handle.close();
        let reason = timeout(WAIT, handle.wait()).await.unwrap();

        assert!(matches!(reason, ListenerError::Closed));
        assert!(!listener.endpoint().socket_path().exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_drops_in_flight_connections() {
        let dir = TempDir::new().unwrap();
        let listener = listener(&dir);
        let handle = listener.start(Arc::new(LineHandler)).unwrap();

        let mut blocked = send(&listener, "block\n").await;
        // let the handler pick the line up
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.close();

        assert_eq!(read_all(&mut blocked).await, "");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_releases_connection_before_it_is_counted_gone() {
        let dir = TempDir::new().unwrap();
        let listener = listener(&dir);
        let handle = listener.start(Arc::new(LineHandler)).unwrap();

        let mut lingering = send(&listener, "linger\n").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.active_connections(), 1);
        handle.close();

        timeout(WAIT, async {
            while handle.active_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_millis(100), lingering.read(&mut buf))
            .await
            .expect("connection still open after it was counted as gone")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_panicking_handler_closes_connection() {
        let dir = TempDir::new().unwrap();
        let listener = listener(&dir);
        let handle = listener.start(Arc::new(LineHandler)).unwrap();

        let mut panicked = send(&listener, "panic\n").await;
        assert_eq!(read_all(&mut panicked).await, "");

        // the listener keeps serving
        let mut next = send(&listener, "still here\n").await;
        assert_eq!(read_all(&mut next).await, "echo still here\n");
        assert!(!handle.is_finished());

        handle.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failing_handler_closes_connection() {
        let dir = TempDir::new().unwrap();
        let listener = listener(&dir);
        let handle = listener.start(Arc::new(LineHandler)).unwrap();

        let mut failed = send(&listener, "fail\n").await;
        assert_eq!(read_all(&mut failed).await, "");

        timeout(WAIT, async {
            while handle.active_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        handle.close();
    }

    #[tokio::test]
    async fn test_second_start_fails_with_bind_error() {
        let dir = TempDir::new().unwrap();
        let listener = listener(&dir);
        let _handle = listener.start(Arc::new(LineHandler)).unwrap();

        let second = listener.start(Arc::new(LineHandler));
        assert!(matches!(
            second,
            Err(ListenerError::Bind(TransportError::InUse(_)))
        ));
    }
}

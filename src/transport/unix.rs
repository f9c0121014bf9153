//! Unix-domain socket endpoint

use super::acl::{AccessControl, PeerPolicy};
use super::{Connection, Endpoint, TransportError};
use nix::unistd::{chown, Gid, Group, Uid, User};
use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

pub struct PlatformListener {
    listener: UnixListener,
    path: PathBuf,
    policy: Arc<PeerPolicy>,
}

impl PlatformListener {
    /// Bind the socket, then restrict it to `acl`.
    ///
    /// Restricted sockets are owned by the first allowed group with mode
    /// 0660; unrestricted ones are 0666.
    pub fn bind(endpoint: &Endpoint, acl: &AccessControl) -> Result<Self, TransportError> {
        let path = endpoint.socket_path();
        let io_err = |source| TransportError::Io {
            endpoint: path.display().to_string(),
            source,
        };

        let (policy, owner) = resolve_groups(acl)?;
        remove_stale_socket(&path)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let listener = UnixListener::bind(&path).map_err(io_err)?;
        let transport = Self {
            listener,
            path: path.clone(),
            policy: Arc::new(policy),
        };

        let mode = match owner {
            Some(gid) => {
                chown(&path, None, Some(gid)).map_err(|e| io_err(io::Error::from(e)))?;
                0o660
            }
            None => 0o666,
        };
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).map_err(io_err)?;

        info!("Listening on {} (mode {:o})", path.display(), mode);
        Ok(transport)
    }

    /// Wait for the next client. Its credentials are checked later, by
    /// [`Incoming::admit`].
    pub async fn accept(&mut self) -> io::Result<Incoming> {
        let (stream, _) = self.listener.accept().await?;
        Ok(Incoming {
            stream,
            policy: Arc::clone(&self.policy),
        })
    }

    pub fn address(&self) -> String {
        self.path.display().to_string()
    }
}

/// A client that has connected but not yet been checked against the ACL.
pub struct Incoming {
    stream: UnixStream,
    policy: Arc<PeerPolicy>,
}

impl Incoming {
    /// Read the peer credentials and apply the ACL.
    ///
    /// Peers outside the ACL are refused with `PermissionDenied`. The user
    /// database lookup for group membership runs on the blocking pool.
    pub async fn admit(self) -> io::Result<Connection> {
        let cred = self.stream.peer_cred()?;
        let (uid, gid) = (cred.uid(), cred.gid());
        let peer = match cred.pid() {
            Some(pid) => format!("pid {} uid {}", pid, uid),
            None => format!("uid {}", uid),
        };

        if !self.policy.permits(uid, gid, None) {
            let user = tokio::task::spawn_blocking(move || {
                User::from_uid(Uid::from_raw(uid)).ok().flatten().map(|u| u.name)
            })
            .await
            .map_err(io::Error::other)?;
            if !self.policy.permits(uid, gid, user.as_deref()) {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("client {} is not in an allowed group", peer),
                ));
            }
        }

        Ok(Connection::unix(self.stream, peer))
    }
}

impl Drop for PlatformListener {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed socket {}", self.path.display()),
            Err(e) => debug!("Could not remove socket {}: {}", self.path.display(), e),
        }
    }
}

fn resolve_groups(acl: &AccessControl) -> Result<(PeerPolicy, Option<Gid>), TransportError> {
    if !acl.is_restricted() {
        return Ok((PeerPolicy::open(), None));
    }

    let mut gids = Vec::new();
    let mut members = Vec::new();
    for name in acl.groups() {
        let group = Group::from_name(name)
            .map_err(|e| TransportError::UnknownPrincipal(format!("{}: {}", name, e)))?
            .ok_or_else(|| TransportError::UnknownPrincipal(name.clone()))?;
        debug!("Allowing group {} (gid {})", name, group.gid);
        gids.push(group.gid);
        members.extend(group.mem);
    }

    let owner = gids.first().copied();
    let policy = PeerPolicy::new(gids.into_iter().map(Gid::as_raw).collect(), members);
    Ok((policy, owner))
}

/// Refuse to steal a live socket; clear a leftover one. Anything at `path`
/// that is not a socket is left alone.
fn remove_stale_socket(path: &Path) -> Result<(), TransportError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(TransportError::Io {
                endpoint: path.display().to_string(),
                source,
            })
        }
    };
    if !metadata.file_type().is_socket() {
        return Err(TransportError::Io {
            endpoint: path.display().to_string(),
            source: io::Error::new(io::ErrorKind::AlreadyExists, "path exists and is not a socket"),
        });
    }
    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(TransportError::InUse(path.display().to_string()));
    }
    warn!("Removing stale socket {}", path.display());
    fs::remove_file(path).map_err(|source| TransportError::Io {
        endpoint: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getgid;
    use tempfile::TempDir;
    use tokio::net::UnixStream;

    fn endpoint(dir: &TempDir) -> Endpoint {
        Endpoint::new(dir.path().join("test.sock").display().to_string())
    }

    #[tokio::test]
    async fn test_bind_unrestricted_socket() {
        let dir = TempDir::new().unwrap();
        let endpoint = endpoint(&dir);

        let listener = PlatformListener::bind(&endpoint, &AccessControl::unrestricted()).unwrap();

        let mode = fs::metadata(endpoint.socket_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);
        assert_eq!(listener.address(), endpoint.socket_path().display().to_string());
    }

    #[tokio::test]
    async fn test_bind_removes_stale_socket() {
        let dir = TempDir::new().unwrap();
        let endpoint = endpoint(&dir);
        // std listeners leave their socket file behind
        drop(std::os::unix::net::UnixListener::bind(endpoint.socket_path()).unwrap());
        assert!(endpoint.socket_path().exists());

        let result = PlatformListener::bind(&endpoint, &AccessControl::unrestricted());
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bind_keeps_regular_file() {
        let dir = TempDir::new().unwrap();
        let endpoint = endpoint(&dir);
        fs::write(endpoint.socket_path(), b"MystPath = \"/usr/bin/myst\"\n").unwrap();

        let result = PlatformListener::bind(&endpoint, &AccessControl::unrestricted());

        match result {
            Err(TransportError::Io { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AlreadyExists)
            }
            Err(other) => panic!("Expected Io error, got {}", other),
            Ok(_) => panic!("Expected bind to fail"),
        }
        let content = fs::read_to_string(endpoint.socket_path()).unwrap();
        assert!(content.contains("MystPath"));
    }

    #[tokio::test]
    async fn test_bind_refuses_live_socket() {
        let dir = TempDir::new().unwrap();
        let endpoint = endpoint(&dir);
        let _first = PlatformListener::bind(&endpoint, &AccessControl::unrestricted()).unwrap();

        let second = PlatformListener::bind(&endpoint, &AccessControl::unrestricted());
        assert!(matches!(second, Err(TransportError::InUse(_))));
    }

    #[tokio::test]
    async fn test_drop_removes_socket_file() {
        let dir = TempDir::new().unwrap();
        let endpoint = endpoint(&dir);

        let listener = PlatformListener::bind(&endpoint, &AccessControl::unrestricted()).unwrap();
        assert!(endpoint.socket_path().exists());
        drop(listener);
        assert!(!endpoint.socket_path().exists());
    }

    #[tokio::test]
    async fn test_unknown_group_fails_bind() {
        let dir = TempDir::new().unwrap();
        let endpoint = endpoint(&dir);
        let acl = AccessControl::new(["no-such-group-myst-test"]);

        let result = PlatformListener::bind(&endpoint, &acl);
        assert!(matches!(result, Err(TransportError::UnknownPrincipal(_))));
        assert!(!endpoint.socket_path().exists());
    }

    #[tokio::test]
    async fn test_restricted_socket_admits_own_group() {
        let dir = TempDir::new().unwrap();
        let endpoint = endpoint(&dir);
        let group = Group::from_gid(getgid()).unwrap().unwrap();
        let acl = AccessControl::new([group.name.clone()]);

        let mut listener = PlatformListener::bind(&endpoint, &acl).unwrap();
        let mode = fs::metadata(endpoint.socket_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);

        let _client = UnixStream::connect(endpoint.socket_path()).await.unwrap();
        let conn = listener.accept().await.unwrap().admit().await.unwrap();
        assert!(conn.peer().contains("uid"));
    }

    #[tokio::test]
    async fn test_accept_defers_peer_check_to_admit() {
        let dir = TempDir::new().unwrap();
        let endpoint = endpoint(&dir);
        let mut listener = PlatformListener::bind(&endpoint, &AccessControl::unrestricted()).unwrap();
        // no allowed groups at all: only root gets in
        listener.policy = Arc::new(PeerPolicy::new(Vec::new(), Vec::new()));

        let _client = UnixStream::connect(endpoint.socket_path()).await.unwrap();
        let incoming = listener.accept().await.unwrap();
        let admitted = incoming.admit().await;

        if Uid::effective().is_root() {
            assert!(admitted.is_ok());
        } else {
            let err = admitted.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        }

        // the listener keeps accepting after a refused peer
        let _next = UnixStream::connect(endpoint.socket_path()).await.unwrap();
        assert!(listener.accept().await.is_ok());
    }
}

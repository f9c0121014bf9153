//! Who may open the control channel
//!
//! Administrators and the system principal are always allowed. Configured
//! groups are added on top. With no groups the channel falls back to the
//! transport's default security.

/// Administrators and LocalSystem get full access; nobody else is listed.
const BASE_SDDL: &str = "D:P(A;;GA;;;BA)(A;;GA;;;SY)";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessControl {
    groups: Vec<String>,
}

impl AccessControl {
    pub fn new<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    /// No groups beyond the built-in administrators.
    pub fn unrestricted() -> Self {
        Self::default()
    }

    /// `Users` on Windows, nothing elsewhere.
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            Self::new(["Users"])
        } else {
            Self::unrestricted()
        }
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn is_restricted(&self) -> bool {
        !self.groups.is_empty()
    }
}

/// Security descriptor granting read/write to each of `sids`.
pub fn sddl_for<S: AsRef<str>>(sids: &[S]) -> String {
    let mut sddl = String::from(BASE_SDDL);
    for sid in sids {
        sddl.push_str(&format!("(A;;GRGW;;;{})", sid.as_ref()));
    }
    sddl
}

/// Resolved group set used to vet Unix socket peers.
#[derive(Debug, Clone, Default)]
pub struct PeerPolicy {
    restricted: bool,
    gids: Vec<u32>,
    members: Vec<String>,
}

impl PeerPolicy {
    /// Accepts every peer.
    pub fn open() -> Self {
        Self::default()
    }

    /// Accepts root, peers whose primary gid is in `gids`, and the listed
    /// `members` of those groups.
    pub fn new(gids: Vec<u32>, members: Vec<String>) -> Self {
        Self {
            restricted: true,
            gids,
            members,
        }
    }

    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    pub fn permits(&self, uid: u32, gid: u32, user: Option<&str>) -> bool {
        if !self.restricted || uid == 0 || self.gids.contains(&gid) {
            return true;
        }
        user.is_some_and(|name| self.members.iter().any(|m| m == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sddl_without_groups() {
        assert_eq!(sddl_for::<&str>(&[]), "D:P(A;;GA;;;BA)(A;;GA;;;SY)");
    }

    #[test]
    fn test_sddl_with_groups() {
        let sddl = sddl_for(&["S-1-5-32-545", "S-1-5-21-1-2-3-1001"]);
        assert_eq!(
            sddl,
            "D:P(A;;GA;;;BA)(A;;GA;;;SY)(A;;GRGW;;;S-1-5-32-545)(A;;GRGW;;;S-1-5-21-1-2-3-1001)"
        );
    }

    #[test]
    fn test_access_control_groups() {
        let acl = AccessControl::new(["wheel", "vpn"]);
        assert!(acl.is_restricted());
        assert_eq!(acl.groups(), &["wheel".to_string(), "vpn".to_string()]);

        assert!(!AccessControl::unrestricted().is_restricted());
    }

    #[test]
    fn test_platform_default() {
        let acl = AccessControl::platform_default();
        if cfg!(windows) {
            assert_eq!(acl.groups(), &["Users".to_string()]);
        } else {
            assert!(!acl.is_restricted());
        }
    }

    #[test]
    fn test_open_policy_permits_everyone() {
        let policy = PeerPolicy::open();
        assert!(policy.permits(1000, 1000, None));
    }

    #[test]
    fn test_restricted_policy() {
        let policy = PeerPolicy::new(vec![50], vec!["alice".to_string()]);

        assert!(policy.permits(0, 0, Some("root")));
        assert!(policy.permits(1001, 50, None));
        assert!(policy.permits(1002, 100, Some("alice")));
        assert!(!policy.permits(1003, 100, Some("mallory")));
        assert!(!policy.permits(1003, 100, None));
    }
}

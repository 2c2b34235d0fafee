//! Fact sources consumed by the location permission checker.
//!
//! The checker is pure decision logic; everything it knows about the caller
//! comes through [`PermissionFacts`], supplied by the platform (or a test
//! double). The one side-effecting call is [`PermissionFacts::note_app_op`],
//! which meters usage in the platform's app-op ledger.

/// Platform permission names consulted by the checker.
pub mod perms {
    /// Coarse location grant, sufficient for legacy callers.
    pub const COARSE_LOCATION: &str = "coarse-location";
    /// Fine location grant, required for fine-gated callers.
    pub const FINE_LOCATION: &str = "fine-location";
    /// Privileged bypass for the location-enabled check.
    pub const NETWORK_SETTINGS: &str = "network-settings";
    /// Required to act on behalf of another user in the same profile group.
    pub const INTERACT_ACROSS_USERS: &str = "interact-across-users";
}

/// Number of uids reserved per user. A uid's owning user is
/// `uid / UIDS_PER_USER`.
pub const UIDS_PER_USER: u32 = 100_000;

/// A caller's request to access location-derived scan results.
///
/// Immutable per call; the checker never retains it.
#[derive(Debug, Clone)]
pub struct PermissionQuery {
    /// Package name the caller claims.
    pub package: String,
    /// Optional attribution tag recorded alongside app-op notes.
    pub attribution_tag: Option<String>,
    /// Numeric identity of the calling process owner.
    pub uid: u32,
    /// Numeric identity of the calling process.
    pub pid: i32,
    /// Skip app-op mode checks. Platform permission grants still apply.
    pub bypass_app_ops: bool,
}

impl PermissionQuery {
    pub fn new(package: impl Into<String>, uid: u32, pid: i32) -> Self {
        Self {
            package: package.into(),
            attribution_tag: None,
            uid,
            pid,
            bypass_app_ops: false,
        }
    }

    /// The user owning the calling uid.
    pub fn user(&self) -> u32 {
        self.uid / UIDS_PER_USER
    }
}

/// Grant state of a platform permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionGrant {
    Granted,
    Denied,
}

/// Mode of an app-op, the privacy overlay layered atop permission grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppOpMode {
    Allowed,
    Ignored,
    Errored,
    Default,
}

/// App-ops the checker meters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppOp {
    /// Legacy scan op; allowed mode alone satisfies the legacy branch.
    WifiScan,
    CoarseLocation,
    FineLocation,
}

/// Read-only snapshot of the platform facts a permission decision depends on.
///
/// `note_app_op` is metered: every call records usage against the caller, so
/// the checker only notes an op once the matching grant has already passed.
pub trait PermissionFacts {
    /// Whether `package` belongs to `uid` in the package registry.
    fn package_matches_uid(&self, package: &str, uid: u32) -> bool;

    /// Declared API level of the target package, if known.
    fn target_sdk(&self, package: &str) -> Option<u32>;

    /// Grant state of a platform permission for the calling identity.
    fn check_permission(&self, name: &str, pid: i32, uid: u32) -> PermissionGrant;

    /// Note an app-op against the caller and return its mode.
    fn note_app_op(
        &self,
        op: AppOp,
        uid: u32,
        package: &str,
        attribution_tag: Option<&str>,
    ) -> AppOpMode;

    /// Whether two users belong to the same profile group.
    fn is_same_profile_group(&self, user_a: u32, user_b: u32) -> bool;

    /// Whether the location service is enabled for `user`.
    fn is_location_enabled(&self, user: u32) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_maps_uid_to_owning_user() {
        let query = PermissionQuery::new("com.example.scanner", 1_100_000, 42);
        assert_eq!(query.user(), 11);
    }

    #[test]
    fn query_defaults_are_unset() {
        let query = PermissionQuery::new("com.example.scanner", 1000, 42);
        assert_eq!(query.attribution_tag, None);
        assert!(!query.bypass_app_ops);
    }
}

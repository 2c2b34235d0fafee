//! Core location permission decision logic.

use crate::error::{Error, NetResult};

use super::facts::{perms, AppOp, AppOpMode, PermissionFacts, PermissionGrant, PermissionQuery};

/// API level at which fine location became required for scan results.
pub const FINE_GATING_SDK: u32 = 29;

/// Outcome of a location permission evaluation.
///
/// These are decision values, not errors: the caller may re-request after the
/// user grants the permission or re-enables location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationDecision {
    /// The caller may access scan results.
    Succeeded,
    /// The required location permission or app-op is missing. Reported even
    /// when location is globally off.
    PermissionMissing,
    /// Permissions are in place but the location service is disabled for the
    /// acting user and the caller holds no privileged bypass.
    LocationModeOff,
}

/// Stateless evaluator for location-gated scan access.
///
/// Every call is independent; concurrent evaluations share no mutable state.
/// The current-user lookup is injected so tests can pin the acting user
/// without privileged platform calls.
pub struct LocationPermissionChecker {
    current_user: Box<dyn Fn() -> u32 + Send + Sync>,
}

impl LocationPermissionChecker {
    pub fn new(current_user: impl Fn() -> u32 + Send + Sync + 'static) -> Self {
        Self {
            current_user: Box::new(current_user),
        }
    }

    /// Evaluate a caller's access to location-derived scan results.
    ///
    /// Checks run in order and short-circuit:
    /// 1. package/uid identity (mismatch is a hard [`Error::Security`] deny);
    /// 2. cross-profile access when the acting user is not the current user;
    /// 3. the required location permission and its app-op, selected by the
    ///    target's API level — exactly one branch runs;
    /// 4. location-service availability, bypassed by the network-settings
    ///    privilege.
    pub fn evaluate(
        &self,
        query: &PermissionQuery,
        facts: &dyn PermissionFacts,
    ) -> NetResult<LocationDecision> {
        if !facts.package_matches_uid(&query.package, query.uid) {
            return Err(Error::Security(format!(
                "package {} does not belong to uid {}",
                query.package, query.uid
            )));
        }

        let user = query.user();
        let current = (self.current_user)();
        if user != current && !self.may_act_across_profiles(query, facts, user, current) {
            return Ok(LocationDecision::PermissionMissing);
        }

        if !self.has_location_permission(query, facts) {
            return Ok(LocationDecision::PermissionMissing);
        }

        if !facts.is_location_enabled(user)
            && facts.check_permission(perms::NETWORK_SETTINGS, query.pid, query.uid)
                == PermissionGrant::Denied
        {
            return Ok(LocationDecision::LocationModeOff);
        }

        Ok(LocationDecision::Succeeded)
    }

    /// A caller from another user is trusted only when that user shares the
    /// current user's profile group and the caller holds the cross-profile
    /// permission.
    fn may_act_across_profiles(
        &self,
        query: &PermissionQuery,
        facts: &dyn PermissionFacts,
        user: u32,
        current: u32,
    ) -> bool {
        facts.is_same_profile_group(current, user)
            && facts.check_permission(perms::INTERACT_ACROSS_USERS, query.pid, query.uid)
                == PermissionGrant::Granted
    }

    /// Exactly one branch runs. A denied grant returns before any op is
    /// noted, so deciding on fine grounds never meters the coarse or legacy
    /// ops, and vice versa.
    fn has_location_permission(&self, query: &PermissionQuery, facts: &dyn PermissionFacts) -> bool {
        let fine_gated = facts
            .target_sdk(&query.package)
            .map_or(true, |sdk| sdk >= FINE_GATING_SDK);

        if fine_gated {
            facts.check_permission(perms::FINE_LOCATION, query.pid, query.uid)
                == PermissionGrant::Granted
                && self.app_op_allowed(query, facts, AppOp::FineLocation)
        } else {
            let coarse = facts.check_permission(perms::COARSE_LOCATION, query.pid, query.uid)
                == PermissionGrant::Granted
                && self.app_op_allowed(query, facts, AppOp::CoarseLocation);
            // Legacy callers may also qualify through the scan op alone.
            coarse || self.app_op_allowed(query, facts, AppOp::WifiScan)
        }
    }

    fn app_op_allowed(&self, query: &PermissionQuery, facts: &dyn PermissionFacts, op: AppOp) -> bool {
        if query.bypass_app_ops {
            return true;
        }
        facts.note_app_op(op, query.uid, &query.package, query.attribution_tag.as_deref())
            == AppOpMode::Allowed
    }
}

//! Platform connectivity gatekeeping: location-gated scan permissions and
//! IKEv2 platform VPN session management.

pub mod error;
pub mod location;
pub mod vpn;

pub use crate::error::{Error, NetResult};
pub use crate::location::{LocationDecision, LocationPermissionChecker, PermissionQuery};
pub use crate::vpn::{VpnProfile, VpnProfileBuilder, VpnSessionManager};

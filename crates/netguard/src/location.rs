//! Location permission gating for scan APIs.

pub mod checker;
pub mod facts;

pub use checker::{LocationDecision, LocationPermissionChecker, FINE_GATING_SDK};
pub use facts::{AppOp, AppOpMode, PermissionFacts, PermissionGrant, PermissionQuery};

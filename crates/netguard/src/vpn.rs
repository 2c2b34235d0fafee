//! IKEv2 platform VPN: profile provisioning and session lifecycle.

pub mod events;
pub mod manager;
pub mod profile;
pub mod store;

pub use events::{VpnEvent, VpnEventBus};
pub use manager::{
    ConsentLedger, IkeEngine, NetworkCapabilities, NetworkHandle, NetworkPublisher, NetworkUpdate,
    ProfileState, ProvisionOutcome, SessionState, TunnelHandle, TunnelParams, VpnSessionManager,
};
pub use profile::{Auth, ProxyConfig, TunnelConfig, VpnProfile, VpnProfileBuilder};
pub use store::{ProfileStore, ProvisionedProfile};

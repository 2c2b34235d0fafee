//! VPN session lifecycle: provisioning, consent, negotiation, teardown.
//!
//! The manager owns profile storage and the session state machine. It never
//! blocks waiting for the consent UI and never performs IKE cryptography
//! itself; both are external collaborators reached through traits.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex, Notify};
use uuid::Uuid;

use crate::error::{Error, NetResult};

use super::events::{VpnEvent, VpnEventBus};
use super::profile::{Auth, VpnProfile};
use super::store::{ProfileStore, ProvisionedProfile};

const EVENT_BUS_CAPACITY: usize = 32;

/// Opaque handle to an established IKE tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelHandle(pub u64);

/// Opaque handle to a published network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkHandle(pub u64);

/// Parameters handed to the IKE engine, derived from the stored profile at
/// start time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelParams {
    pub server_addr: String,
    pub identity: String,
    pub auth: Auth,
    pub allowed_algorithms: Vec<String>,
    pub max_mtu: u32,
    pub automatic_ip_version: bool,
    pub automatic_keepalive: bool,
    pub test_network_only: bool,
}

impl TunnelParams {
    pub fn from_profile(profile: &VpnProfile) -> Self {
        Self {
            server_addr: profile.server_addr.clone(),
            identity: profile.identity.clone(),
            auth: profile.auth.clone(),
            allowed_algorithms: profile.allowed_algorithms.clone(),
            max_mtu: profile.max_mtu,
            automatic_ip_version: profile.automatic_ip_version,
            automatic_keepalive: profile.automatic_keepalive,
            test_network_only: profile.restricted_to_test_networks,
        }
    }
}

/// Capabilities attached to the published VPN network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkCapabilities {
    pub vpn_transport: bool,
    pub internet: bool,
    pub validated: bool,
    pub owner_uid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkProperties {
    pub interface_name: String,
    pub mtu: u32,
}

/// Asynchronous notifications from the network layer. The manager applies
/// them strictly in arrival order and never coalesces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkUpdate {
    CapabilitiesChanged {
        network: NetworkHandle,
        capabilities: NetworkCapabilities,
    },
    LinkPropertiesChanged {
        network: NetworkHandle,
        link: LinkProperties,
    },
    BlockedStatusChanged {
        network: NetworkHandle,
        blocked: bool,
    },
    Lost(NetworkHandle),
}

/// External IKE negotiation engine.
#[async_trait]
pub trait IkeEngine: Send + Sync {
    async fn negotiate(&self, params: TunnelParams) -> NetResult<TunnelHandle>;
    async fn teardown(&self, handle: TunnelHandle);
}

/// External network publisher.
#[async_trait]
pub trait NetworkPublisher: Send + Sync {
    async fn publish(
        &self,
        capabilities: NetworkCapabilities,
        link: LinkProperties,
    ) -> NetworkHandle;
    async fn update_capabilities(&self, network: NetworkHandle, capabilities: NetworkCapabilities);
    async fn retract(&self, network: NetworkHandle);
}

/// Source of prior user consent and activation privilege.
pub trait ConsentLedger: Send + Sync {
    fn has_legacy_vpn_consent(&self, uid: u32) -> bool;
    fn has_platform_vpn_consent(&self, uid: u32) -> bool;
    fn has_activation_privilege(&self, uid: u32) -> bool;
}

/// Session lifecycle states.
///
/// `Provisioning` means a profile is stored but consent has not been granted
/// yet; the manager parks there until the ledger reports consent at the next
/// `start`. `Validating` means connected but awaiting the external validation
/// pipeline; `Stable` means connected and validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Provisioning,
    Negotiating,
    Connected,
    Validating,
    Stable,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Provisioning => "provisioning",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Validating => "validating",
            SessionState::Stable => "stable",
        };
        write!(f, "{name}")
    }
}

/// Outcome of `provision`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The requesting identity already holds consent; nothing further needed.
    AlreadyConsented,
    /// Consent must be resolved by the platform consent UI for this uid.
    ConsentRequired { uid: u32 },
}

/// Snapshot of the provisioned profile's session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileState {
    pub state: SessionState,
    pub session_token: Option<String>,
    pub always_on: bool,
    pub lockdown: bool,
}

struct SessionInner {
    state: SessionState,
    stored: Option<ProvisionedProfile>,
    session_token: Option<String>,
    tunnel: Option<TunnelHandle>,
    network: Option<NetworkHandle>,
    cancel: Option<Arc<Notify>>,
    /// Bumped on every start/stop; a negotiation task whose epoch no longer
    /// matches has been superseded and must tear down anything it built.
    epoch: u64,
    always_on: bool,
    lockdown: bool,
}

impl SessionInner {
    fn new(stored: Option<ProvisionedProfile>, state: SessionState) -> Self {
        Self {
            state,
            stored,
            session_token: None,
            tunnel: None,
            network: None,
            cancel: None,
            epoch: 0,
            always_on: false,
            lockdown: false,
        }
    }
}

/// Owns the VPN profile and drives one session per owning user.
///
/// State transitions are serialized through an internal mutex: only one
/// `provision`/`start`/`stop`/`delete` is in flight at a time.
pub struct VpnSessionManager {
    inner: Arc<Mutex<SessionInner>>,
    ike: Arc<dyn IkeEngine>,
    publisher: Arc<dyn NetworkPublisher>,
    consent: Arc<dyn ConsentLedger>,
    events: VpnEventBus,
    store: Option<ProfileStore>,
}

impl VpnSessionManager {
    pub fn new(
        ike: Arc<dyn IkeEngine>,
        publisher: Arc<dyn NetworkPublisher>,
        consent: Arc<dyn ConsentLedger>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner::new(
                None,
                SessionState::Disconnected,
            ))),
            ike,
            publisher,
            consent,
            events: VpnEventBus::new(EVENT_BUS_CAPACITY),
            store: None,
        }
    }

    /// Create a manager backed by an on-disk profile store, restoring any
    /// previously provisioned profile.
    pub fn with_store(
        ike: Arc<dyn IkeEngine>,
        publisher: Arc<dyn NetworkPublisher>,
        consent: Arc<dyn ConsentLedger>,
        store: ProfileStore,
    ) -> NetResult<Self> {
        let stored = store.load()?;
        let state = match &stored {
            Some(record) if !Self::is_consented(consent.as_ref(), record.owner_uid) => {
                SessionState::Provisioning
            }
            _ => SessionState::Disconnected,
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(SessionInner::new(stored, state))),
            ike,
            publisher,
            consent,
            events: VpnEventBus::new(EVENT_BUS_CAPACITY),
            store: Some(store),
        })
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<VpnEvent> {
        self.events.subscribe()
    }

    /// Mark the stored profile as always-on, optionally with lockdown.
    pub async fn set_always_on(&self, always_on: bool, lockdown: bool) {
        let mut inner = self.inner.lock().await;
        inner.always_on = always_on;
        inner.lockdown = lockdown;
    }

    /// Store a profile on behalf of `requesting_uid`.
    ///
    /// Replaces any previously stored profile. If the identity already holds
    /// legacy or platform-VPN consent no further action is needed; otherwise
    /// the returned request must be resolved by the platform consent UI — the
    /// manager does not block waiting for it.
    pub async fn provision(
        &self,
        profile: VpnProfile,
        requesting_uid: u32,
    ) -> NetResult<ProvisionOutcome> {
        let mut inner = self.inner.lock().await;
        let record = ProvisionedProfile {
            profile,
            owner_uid: requesting_uid,
            provisioned_at: Utc::now(),
        };
        if let Some(store) = &self.store {
            store.save(&record)?;
        }
        inner.stored = Some(record);
        tracing::info!("vpn profile provisioned for uid {requesting_uid}");

        let consented = Self::is_consented(self.consent.as_ref(), requesting_uid);
        // A running session keeps its state; the new profile takes effect at
        // the next start.
        let idle = matches!(
            inner.state,
            SessionState::Disconnected | SessionState::Provisioning
        );
        if consented {
            if idle && inner.state != SessionState::Disconnected {
                self.transition(&mut inner, SessionState::Disconnected);
            }
            Ok(ProvisionOutcome::AlreadyConsented)
        } else {
            if idle && inner.state != SessionState::Provisioning {
                self.transition(&mut inner, SessionState::Provisioning);
            }
            Ok(ProvisionOutcome::ConsentRequired {
                uid: requesting_uid,
            })
        }
    }

    /// Start the provisioned profile's session.
    ///
    /// Requires a stored profile whose owner holds activation privilege or
    /// consent. Transitions to `Negotiating` and delegates the cryptographic
    /// exchange to the IKE engine on a background task; a session token is
    /// generated only when `use_session_token` is set.
    pub async fn start(&self, use_session_token: bool) -> NetResult<Option<String>> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .stored
            .clone()
            .ok_or_else(|| Error::Config("no provisioned profile".to_string()))?;

        match inner.state {
            SessionState::Disconnected | SessionState::Provisioning => {}
            state => {
                return Err(Error::Config(format!("cannot start from state {state}")));
            }
        }

        let uid = record.owner_uid;
        if !self.consent.has_activation_privilege(uid) && !Self::is_consented(self.consent.as_ref(), uid)
        {
            return Err(Error::Security(format!(
                "uid {uid} has not consented to platform VPN activation"
            )));
        }

        let token = use_session_token.then(|| Uuid::new_v4().to_string());
        inner.session_token = token.clone();
        inner.epoch += 1;
        let epoch = inner.epoch;
        let cancel = Arc::new(Notify::new());
        inner.cancel = Some(Arc::clone(&cancel));
        self.transition(&mut inner, SessionState::Negotiating);
        drop(inner);

        let params = TunnelParams::from_profile(&record.profile);
        let requires_validation = record.profile.requires_validation;
        let mtu = record.profile.max_mtu;
        let inner_arc = Arc::clone(&self.inner);
        let ike = Arc::clone(&self.ike);
        let publisher = Arc::clone(&self.publisher);
        let events = self.events.clone();

        tokio::spawn(async move {
            let negotiated = tokio::select! {
                result = ike.negotiate(params) => result,
                _ = cancel.notified() => return,
            };

            match negotiated {
                Ok(tunnel) => {
                    let mut inner = inner_arc.lock().await;
                    if inner.epoch != epoch || inner.state != SessionState::Negotiating {
                        // Superseded by stop/delete while negotiating.
                        drop(inner);
                        ike.teardown(tunnel).await;
                        return;
                    }
                    inner.tunnel = Some(tunnel);
                    inner.state = SessionState::Connected;
                    events.publish(VpnEvent::StateChanged(SessionState::Connected));
                    tracing::info!("vpn session connected (tunnel {})", tunnel.0);

                    let capabilities = NetworkCapabilities {
                        vpn_transport: true,
                        internet: true,
                        validated: false,
                        owner_uid: uid,
                    };
                    let link = LinkProperties {
                        interface_name: format!("ikev2-tun{}", tunnel.0),
                        mtu,
                    };
                    let network = publisher.publish(capabilities.clone(), link).await;
                    inner.network = Some(network);
                    events.publish(VpnEvent::NetworkAvailable(network));

                    if requires_validation {
                        // The external validation pipeline decides; never
                        // force validation here.
                        inner.state = SessionState::Validating;
                        events.publish(VpnEvent::StateChanged(SessionState::Validating));
                    } else {
                        publisher
                            .update_capabilities(
                                network,
                                NetworkCapabilities {
                                    validated: true,
                                    ..capabilities
                                },
                            )
                            .await;
                        events.publish(VpnEvent::CapabilitiesChanged {
                            network,
                            validated: true,
                        });
                        inner.state = SessionState::Stable;
                        events.publish(VpnEvent::StateChanged(SessionState::Stable));
                    }
                }
                Err(error) => {
                    let mut inner = inner_arc.lock().await;
                    if inner.epoch != epoch {
                        return;
                    }
                    tracing::warn!("vpn negotiation failed: {error}");
                    inner.session_token = None;
                    inner.cancel = None;
                    inner.state = SessionState::Disconnected;
                    events.publish(VpnEvent::StateChanged(SessionState::Disconnected));
                    events.publish(VpnEvent::NegotiationFailed {
                        cause: error.to_string(),
                    });
                }
            }
        });

        Ok(token)
    }

    /// Stop the session: cancel any in-flight negotiation, tear down the
    /// tunnel, retract the network, clear the session token. Idempotent; the
    /// stored profile survives and the session can be started again.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Disconnected {
            return;
        }
        self.teardown_locked(&mut inner).await;
    }

    /// Remove the stored profile, stopping any active session first.
    /// Permitted regardless of consent state; a subsequent `start` without
    /// re-provisioning fails with a configuration fault.
    pub async fn delete(&self) -> NetResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Disconnected {
            self.teardown_locked(&mut inner).await;
        }
        inner.stored = None;
        if let Some(store) = &self.store {
            store.delete()?;
        }
        tracing::info!("vpn profile deleted");
        Ok(())
    }

    /// Current state of the provisioned profile, or `None` when no profile is
    /// provisioned.
    pub async fn get_profile_state(&self) -> Option<ProfileState> {
        let inner = self.inner.lock().await;
        inner.stored.as_ref()?;
        Some(ProfileState {
            state: inner.state,
            session_token: inner.session_token.clone(),
            always_on: inner.always_on,
            lockdown: inner.lockdown,
        })
    }

    /// Apply a notification from the network layer. Updates are applied in
    /// arrival order; a `validated` capability change promotes the session to
    /// `Stable`, and loss of the session's network tears it down.
    pub async fn handle_network_update(&self, update: NetworkUpdate) {
        let mut inner = self.inner.lock().await;
        match update {
            NetworkUpdate::CapabilitiesChanged {
                network,
                capabilities,
            } if inner.network == Some(network) => {
                self.events.publish(VpnEvent::CapabilitiesChanged {
                    network,
                    validated: capabilities.validated,
                });
                if capabilities.validated
                    && matches!(
                        inner.state,
                        SessionState::Connected | SessionState::Validating
                    )
                {
                    self.transition(&mut inner, SessionState::Stable);
                }
            }
            NetworkUpdate::Lost(network) if inner.network == Some(network) => {
                tracing::warn!("vpn network {} lost", network.0);
                self.teardown_locked(&mut inner).await;
            }
            NetworkUpdate::LinkPropertiesChanged { .. }
            | NetworkUpdate::BlockedStatusChanged { .. } => {}
            // Updates for networks this session no longer owns.
            _ => {}
        }
    }

    fn is_consented(consent: &dyn ConsentLedger, uid: u32) -> bool {
        consent.has_platform_vpn_consent(uid) || consent.has_legacy_vpn_consent(uid)
    }

    fn transition(&self, inner: &mut SessionInner, state: SessionState) {
        tracing::info!("vpn session state: {} -> {}", inner.state, state);
        inner.state = state;
        self.events.publish(VpnEvent::StateChanged(state));
    }

    async fn teardown_locked(&self, inner: &mut SessionInner) {
        inner.epoch += 1;
        if let Some(cancel) = inner.cancel.take() {
            cancel.notify_one();
        }
        if let Some(network) = inner.network.take() {
            self.publisher.retract(network).await;
            self.events.publish(VpnEvent::NetworkLost(network));
        }
        if let Some(tunnel) = inner.tunnel.take() {
            self.ike.teardown(tunnel).await;
        }
        inner.session_token = None;
        self.transition(inner, SessionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::profile::VpnProfile;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;
    use tokio::time::{timeout, Duration};

    const OWNER_UID: u32 = 10_042;

    enum IkeBehavior {
        Succeed,
        Fail,
        Pending,
    }

    struct FakeIke {
        behavior: IkeBehavior,
        next_handle: AtomicU64,
        negotiated: StdMutex<Vec<TunnelParams>>,
        torn_down: StdMutex<Vec<TunnelHandle>>,
    }

    impl FakeIke {
        fn new(behavior: IkeBehavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                next_handle: AtomicU64::new(1),
                negotiated: StdMutex::new(Vec::new()),
                torn_down: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl IkeEngine for FakeIke {
        async fn negotiate(&self, params: TunnelParams) -> NetResult<TunnelHandle> {
            self.negotiated.lock().expect("negotiated").push(params);
            match self.behavior {
                IkeBehavior::Succeed => Ok(TunnelHandle(
                    self.next_handle.fetch_add(1, Ordering::SeqCst),
                )),
                IkeBehavior::Fail => {
                    Err(Error::Negotiation("no proposal chosen".to_string()))
                }
                IkeBehavior::Pending => std::future::pending().await,
            }
        }

        async fn teardown(&self, handle: TunnelHandle) {
            self.torn_down.lock().expect("torn down").push(handle);
        }
    }

    struct FakePublisher {
        next_handle: AtomicU64,
        published: StdMutex<Vec<(NetworkCapabilities, LinkProperties)>>,
        updates: StdMutex<Vec<(NetworkHandle, NetworkCapabilities)>>,
        retracted: StdMutex<Vec<NetworkHandle>>,
    }

    impl FakePublisher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                next_handle: AtomicU64::new(1),
                published: StdMutex::new(Vec::new()),
                updates: StdMutex::new(Vec::new()),
                retracted: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl NetworkPublisher for FakePublisher {
        async fn publish(
            &self,
            capabilities: NetworkCapabilities,
            link: LinkProperties,
        ) -> NetworkHandle {
            self.published
                .lock()
                .expect("published")
                .push((capabilities, link));
            NetworkHandle(self.next_handle.fetch_add(1, Ordering::SeqCst))
        }

        async fn update_capabilities(
            &self,
            network: NetworkHandle,
            capabilities: NetworkCapabilities,
        ) {
            self.updates
                .lock()
                .expect("updates")
                .push((network, capabilities));
        }

        async fn retract(&self, network: NetworkHandle) {
            self.retracted.lock().expect("retracted").push(network);
        }
    }

    struct FakeConsent {
        platform: AtomicBool,
        legacy: AtomicBool,
        privilege: AtomicBool,
    }

    impl FakeConsent {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                platform: AtomicBool::new(false),
                legacy: AtomicBool::new(false),
                privilege: AtomicBool::new(false),
            })
        }

        fn grant_platform(&self) {
            self.platform.store(true, Ordering::SeqCst);
        }
    }

    impl ConsentLedger for FakeConsent {
        fn has_legacy_vpn_consent(&self, _uid: u32) -> bool {
            self.legacy.load(Ordering::SeqCst)
        }

        fn has_platform_vpn_consent(&self, _uid: u32) -> bool {
            self.platform.load(Ordering::SeqCst)
        }

        fn has_activation_privilege(&self, _uid: u32) -> bool {
            self.privilege.load(Ordering::SeqCst)
        }
    }

    fn test_profile(requires_validation: bool) -> VpnProfile {
        VpnProfile::builder("vpn.example.com", "client.example.com")
            .auth_psk(b"ikeTestPsk")
            .expect("psk")
            .requires_validation(requires_validation)
            .build()
            .expect("build")
    }

    fn manager(
        behavior: IkeBehavior,
    ) -> (
        VpnSessionManager,
        Arc<FakeIke>,
        Arc<FakePublisher>,
        Arc<FakeConsent>,
    ) {
        let ike = FakeIke::new(behavior);
        let publisher = FakePublisher::new();
        let consent = FakeConsent::new();
        let manager = VpnSessionManager::new(
            Arc::clone(&ike) as Arc<dyn IkeEngine>,
            Arc::clone(&publisher) as Arc<dyn NetworkPublisher>,
            Arc::clone(&consent) as Arc<dyn ConsentLedger>,
        );
        (manager, ike, publisher, consent)
    }

    async fn next_event(rx: &mut broadcast::Receiver<VpnEvent>) -> VpnEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event timeout")
            .expect("event stream")
    }

    async fn wait_for_state(rx: &mut broadcast::Receiver<VpnEvent>, target: SessionState) {
        for _ in 0..32 {
            if next_event(rx).await == VpnEvent::StateChanged(target) {
                return;
            }
        }
        panic!("never reached state {target}");
    }

    #[tokio::test]
    async fn profile_state_absent_without_profile() {
        let (manager, _, _, _) = manager(IkeBehavior::Succeed);
        assert_eq!(manager.get_profile_state().await, None);
    }

    #[tokio::test]
    async fn start_without_profile_is_config_fault() {
        let (manager, _, _, _) = manager(IkeBehavior::Succeed);
        assert!(matches!(manager.start(false).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn provision_without_consent_requires_consent() {
        let (manager, _, _, _) = manager(IkeBehavior::Succeed);
        let outcome = manager
            .provision(test_profile(false), OWNER_UID)
            .await
            .expect("provision");
        assert_eq!(outcome, ProvisionOutcome::ConsentRequired { uid: OWNER_UID });

        let state = manager.get_profile_state().await.expect("profile state");
        assert_eq!(state.state, SessionState::Provisioning);
        assert!(!state.always_on);
        assert!(!state.lockdown);
    }

    #[tokio::test]
    async fn provision_with_prior_consent_needs_no_action() {
        let (manager, _, _, consent) = manager(IkeBehavior::Succeed);
        consent.grant_platform();
        let outcome = manager
            .provision(test_profile(false), OWNER_UID)
            .await
            .expect("provision");
        assert_eq!(outcome, ProvisionOutcome::AlreadyConsented);
        let state = manager.get_profile_state().await.expect("profile state");
        assert_eq!(state.state, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn start_without_consent_is_security_fault() {
        let (manager, _, _, _) = manager(IkeBehavior::Succeed);
        manager
            .provision(test_profile(false), OWNER_UID)
            .await
            .expect("provision");

        assert!(matches!(
            manager.start(false).await,
            Err(Error::Security(_))
        ));
        let state = manager.get_profile_state().await.expect("profile state");
        assert_eq!(state.state, SessionState::Provisioning);
    }

    #[tokio::test]
    async fn consent_grant_then_start_connects_and_validates() {
        let (manager, _, publisher, consent) = manager(IkeBehavior::Succeed);
        manager
            .provision(test_profile(false), OWNER_UID)
            .await
            .expect("provision");
        consent.grant_platform();

        let mut rx = manager.subscribe();
        let token = manager.start(false).await.expect("start");
        assert_eq!(token, None);

        assert_eq!(
            next_event(&mut rx).await,
            VpnEvent::StateChanged(SessionState::Negotiating)
        );
        assert_eq!(
            next_event(&mut rx).await,
            VpnEvent::StateChanged(SessionState::Connected)
        );
        assert_eq!(
            next_event(&mut rx).await,
            VpnEvent::NetworkAvailable(NetworkHandle(1))
        );
        assert_eq!(
            next_event(&mut rx).await,
            VpnEvent::CapabilitiesChanged {
                network: NetworkHandle(1),
                validated: true
            }
        );
        assert_eq!(
            next_event(&mut rx).await,
            VpnEvent::StateChanged(SessionState::Stable)
        );

        let published = publisher.published.lock().expect("published").clone();
        assert_eq!(published.len(), 1);
        assert_eq!(
            published[0].0,
            NetworkCapabilities {
                vpn_transport: true,
                internet: true,
                validated: false,
                owner_uid: OWNER_UID,
            }
        );

        // Promoted without external probing because validation is not
        // required by the profile.
        let updates = publisher.updates.lock().expect("updates").clone();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].1.validated);
    }

    #[tokio::test]
    async fn validation_required_waits_for_external_pipeline() {
        let (manager, _, publisher, consent) = manager(IkeBehavior::Succeed);
        consent.grant_platform();
        manager
            .provision(test_profile(true), OWNER_UID)
            .await
            .expect("provision");

        let mut rx = manager.subscribe();
        manager.start(false).await.expect("start");
        wait_for_state(&mut rx, SessionState::Validating).await;

        // The manager must not force validation on its own.
        assert!(publisher.updates.lock().expect("updates").is_empty());

        manager
            .handle_network_update(NetworkUpdate::CapabilitiesChanged {
                network: NetworkHandle(1),
                capabilities: NetworkCapabilities {
                    vpn_transport: true,
                    internet: true,
                    validated: true,
                    owner_uid: OWNER_UID,
                },
            })
            .await;

        wait_for_state(&mut rx, SessionState::Stable).await;
        let state = manager.get_profile_state().await.expect("profile state");
        assert_eq!(state.state, SessionState::Stable);
    }

    #[tokio::test]
    async fn session_token_only_when_requested() {
        let (manager, _, _, consent) = manager(IkeBehavior::Succeed);
        consent.grant_platform();
        manager
            .provision(test_profile(false), OWNER_UID)
            .await
            .expect("provision");

        let mut rx = manager.subscribe();
        let token = manager.start(true).await.expect("start");
        let token = token.expect("session token");
        assert!(!token.is_empty());

        wait_for_state(&mut rx, SessionState::Stable).await;
        let state = manager.get_profile_state().await.expect("profile state");
        assert_eq!(state.session_token.as_deref(), Some(token.as_str()));

        manager.stop().await;
        let state = manager.get_profile_state().await.expect("profile state");
        assert_eq!(state.session_token, None);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (manager, ike, publisher, consent) = manager(IkeBehavior::Succeed);
        consent.grant_platform();
        manager
            .provision(test_profile(false), OWNER_UID)
            .await
            .expect("provision");

        let mut rx = manager.subscribe();
        manager.start(false).await.expect("start");
        wait_for_state(&mut rx, SessionState::Stable).await;

        manager.stop().await;
        manager.stop().await;

        assert_eq!(publisher.retracted.lock().expect("retracted").len(), 1);
        assert_eq!(ike.torn_down.lock().expect("torn down").len(), 1);
        let state = manager.get_profile_state().await.expect("profile state");
        assert_eq!(state.state, SessionState::Disconnected);
    }

    #[tokio::test]
    async fn stop_cancels_in_flight_negotiation() {
        let (manager, _, publisher, consent) = manager(IkeBehavior::Pending);
        consent.grant_platform();
        manager
            .provision(test_profile(false), OWNER_UID)
            .await
            .expect("provision");

        let mut rx = manager.subscribe();
        manager.start(false).await.expect("start");
        wait_for_state(&mut rx, SessionState::Negotiating).await;

        manager.stop().await;
        wait_for_state(&mut rx, SessionState::Disconnected).await;

        let state = manager.get_profile_state().await.expect("profile state");
        assert_eq!(state.state, SessionState::Disconnected);
        assert!(publisher.published.lock().expect("published").is_empty());
    }

    #[tokio::test]
    async fn negotiation_failure_rolls_back_to_disconnected() {
        let (manager, _, publisher, consent) = manager(IkeBehavior::Fail);
        consent.grant_platform();
        manager
            .provision(test_profile(false), OWNER_UID)
            .await
            .expect("provision");

        let mut rx = manager.subscribe();
        manager.start(true).await.expect("start");
        wait_for_state(&mut rx, SessionState::Disconnected).await;
        assert_eq!(
            next_event(&mut rx).await,
            VpnEvent::NegotiationFailed {
                cause: "negotiation failure: no proposal chosen".to_string()
            }
        );

        assert!(publisher.published.lock().expect("published").is_empty());
        let state = manager.get_profile_state().await.expect("profile state");
        assert_eq!(state.state, SessionState::Disconnected);
        assert_eq!(state.session_token, None);
    }

    #[tokio::test]
    async fn delete_then_start_is_config_fault() {
        let (manager, _, _, consent) = manager(IkeBehavior::Succeed);
        consent.grant_platform();
        manager
            .provision(test_profile(false), OWNER_UID)
            .await
            .expect("provision");

        manager.delete().await.expect("delete");
        assert_eq!(manager.get_profile_state().await, None);
        assert!(matches!(manager.start(false).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn lost_network_tears_the_session_down() {
        let (manager, ike, _, consent) = manager(IkeBehavior::Succeed);
        consent.grant_platform();
        manager
            .provision(test_profile(false), OWNER_UID)
            .await
            .expect("provision");

        let mut rx = manager.subscribe();
        manager.start(false).await.expect("start");
        wait_for_state(&mut rx, SessionState::Stable).await;

        manager
            .handle_network_update(NetworkUpdate::Lost(NetworkHandle(1)))
            .await;

        let state = manager.get_profile_state().await.expect("profile state");
        assert_eq!(state.state, SessionState::Disconnected);
        assert_eq!(ike.torn_down.lock().expect("torn down").len(), 1);
    }

    #[tokio::test]
    async fn session_restarts_after_stop() {
        let (manager, _, publisher, consent) = manager(IkeBehavior::Succeed);
        consent.grant_platform();
        manager
            .provision(test_profile(false), OWNER_UID)
            .await
            .expect("provision");

        let mut rx = manager.subscribe();
        manager.start(false).await.expect("start");
        wait_for_state(&mut rx, SessionState::Stable).await;
        manager.stop().await;

        manager.start(false).await.expect("restart");
        wait_for_state(&mut rx, SessionState::Stable).await;
        assert_eq!(publisher.published.lock().expect("published").len(), 2);
    }

    #[tokio::test]
    async fn start_from_connected_state_is_config_fault() {
        let (manager, _, _, consent) = manager(IkeBehavior::Succeed);
        consent.grant_platform();
        manager
            .provision(test_profile(false), OWNER_UID)
            .await
            .expect("provision");

        let mut rx = manager.subscribe();
        manager.start(false).await.expect("start");
        wait_for_state(&mut rx, SessionState::Stable).await;

        assert!(matches!(manager.start(false).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn store_backed_manager_restores_profile() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("profile.json");

        let ike = FakeIke::new(IkeBehavior::Succeed);
        let publisher = FakePublisher::new();
        let consent = FakeConsent::new();
        consent.grant_platform();

        let manager = VpnSessionManager::with_store(
            Arc::clone(&ike) as Arc<dyn IkeEngine>,
            Arc::clone(&publisher) as Arc<dyn NetworkPublisher>,
            Arc::clone(&consent) as Arc<dyn ConsentLedger>,
            ProfileStore::new(&path),
        )
        .expect("manager");
        manager
            .provision(test_profile(false), OWNER_UID)
            .await
            .expect("provision");
        drop(manager);

        let restored = VpnSessionManager::with_store(
            Arc::clone(&ike) as Arc<dyn IkeEngine>,
            Arc::clone(&publisher) as Arc<dyn NetworkPublisher>,
            Arc::clone(&consent) as Arc<dyn ConsentLedger>,
            ProfileStore::new(&path),
        )
        .expect("manager");
        let state = restored.get_profile_state().await.expect("profile state");
        assert_eq!(state.state, SessionState::Disconnected);

        restored.delete().await.expect("delete");
        assert!(!path.exists());
    }
}

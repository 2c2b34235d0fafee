//! IKEv2 VPN profile and its builder.
//!
//! Authentication modes are mutually exclusive: a profile carries exactly one
//! of a pre-shared key, username/password, digital signature, or
//! externally-supplied tunnel parameters. The builder rejects a second
//! assignment instead of silently replacing the first.

use serde::{Deserialize, Serialize};

use crate::error::{Error, NetResult};

/// Default ceiling for the tunnel MTU.
pub const DEFAULT_MAX_MTU: u32 = 1360;
/// Lowest MTU an IPv6-capable tunnel can run with.
pub const MIN_MTU: u32 = 1280;

/// HTTP proxy applied to traffic on the VPN network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

/// Externally-supplied tunnel parameters.
///
/// The caller owns the full IKE session configuration; the in-profile auth
/// setters are forbidden for profiles built from these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub server_addr: String,
    pub identity: String,
    pub ike_proposals: Vec<String>,
    pub child_proposals: Vec<String>,
}

/// Authentication material for the tunnel, exactly one variant per profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Auth {
    PresharedKey(Vec<u8>),
    UsernamePassword {
        username: String,
        password: String,
        server_root_ca: Option<String>,
    },
    DigitalSignature {
        user_cert: String,
        private_key: String,
        server_root_ca: String,
    },
    TunnelConfig(TunnelConfig),
}

/// A validated, immutable IKEv2 VPN profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnProfile {
    pub server_addr: String,
    pub identity: String,
    pub auth: Auth,
    pub allowed_algorithms: Vec<String>,
    pub max_mtu: u32,
    pub metered: bool,
    pub bypassable: bool,
    pub proxy: Option<ProxyConfig>,
    /// When set, the network stays unvalidated until the external validation
    /// pipeline reports success; when unset, the network is promoted to
    /// validated immediately after connect.
    pub requires_validation: bool,
    pub automatic_ip_version: bool,
    pub automatic_keepalive: bool,
    pub restricted_to_test_networks: bool,
}

impl VpnProfile {
    pub fn builder(server_addr: impl Into<String>, identity: impl Into<String>) -> VpnProfileBuilder {
        VpnProfileBuilder::new(server_addr, identity)
    }

    /// The pre-shared key, when that is the configured auth mode.
    pub fn preshared_key(&self) -> Option<&[u8]> {
        match &self.auth {
            Auth::PresharedKey(psk) => Some(psk),
            _ => None,
        }
    }

    pub fn username(&self) -> Option<&str> {
        match &self.auth {
            Auth::UsernamePassword { username, .. } => Some(username),
            _ => None,
        }
    }

    pub fn password(&self) -> Option<&str> {
        match &self.auth {
            Auth::UsernamePassword { password, .. } => Some(password),
            _ => None,
        }
    }

    pub fn user_cert(&self) -> Option<&str> {
        match &self.auth {
            Auth::DigitalSignature { user_cert, .. } => Some(user_cert),
            _ => None,
        }
    }

    pub fn private_key(&self) -> Option<&str> {
        match &self.auth {
            Auth::DigitalSignature { private_key, .. } => Some(private_key),
            _ => None,
        }
    }

    pub fn server_root_ca(&self) -> Option<&str> {
        match &self.auth {
            Auth::UsernamePassword { server_root_ca, .. } => server_root_ca.as_deref(),
            Auth::DigitalSignature { server_root_ca, .. } => Some(server_root_ca),
            _ => None,
        }
    }

    pub fn tunnel_config(&self) -> Option<&TunnelConfig> {
        match &self.auth {
            Auth::TunnelConfig(config) => Some(config),
            _ => None,
        }
    }
}

/// Builder for [`VpnProfile`].
pub struct VpnProfileBuilder {
    server_addr: String,
    identity: String,
    auth: Option<Auth>,
    /// Set for tunnel-config builders, where in-profile auth is forbidden.
    external_params: bool,
    allowed_algorithms: Vec<String>,
    max_mtu: u32,
    metered: bool,
    bypassable: bool,
    proxy: Option<ProxyConfig>,
    requires_validation: bool,
    automatic_ip_version: bool,
    automatic_keepalive: bool,
    restricted_to_test_networks: bool,
}

impl VpnProfileBuilder {
    pub fn new(server_addr: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            identity: identity.into(),
            auth: None,
            external_params: false,
            allowed_algorithms: Vec::new(),
            max_mtu: DEFAULT_MAX_MTU,
            metered: true,
            bypassable: false,
            proxy: None,
            requires_validation: false,
            automatic_ip_version: false,
            automatic_keepalive: false,
            restricted_to_test_networks: false,
        }
    }

    /// Build from externally-supplied tunnel parameters. The three in-profile
    /// auth setters fail on the returned builder.
    pub fn from_tunnel_config(config: TunnelConfig) -> Self {
        let mut builder = Self::new(config.server_addr.clone(), config.identity.clone());
        builder.auth = Some(Auth::TunnelConfig(config));
        builder.external_params = true;
        builder
    }

    pub fn auth_psk(mut self, psk: &[u8]) -> NetResult<Self> {
        self.set_auth(Auth::PresharedKey(psk.to_vec()))?;
        Ok(self)
    }

    pub fn auth_username_password(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        server_root_ca: Option<String>,
    ) -> NetResult<Self> {
        self.set_auth(Auth::UsernamePassword {
            username: username.into(),
            password: password.into(),
            server_root_ca,
        })?;
        Ok(self)
    }

    pub fn auth_digital_signature(
        mut self,
        user_cert: impl Into<String>,
        private_key: impl Into<String>,
        server_root_ca: impl Into<String>,
    ) -> NetResult<Self> {
        self.set_auth(Auth::DigitalSignature {
            user_cert: user_cert.into(),
            private_key: private_key.into(),
            server_root_ca: server_root_ca.into(),
        })?;
        Ok(self)
    }

    fn set_auth(&mut self, auth: Auth) -> NetResult<()> {
        if self.external_params {
            return Err(Error::Config(
                "tunnel parameters already supply authentication".to_string(),
            ));
        }
        if self.auth.is_some() {
            return Err(Error::Config(
                "authentication mode already set".to_string(),
            ));
        }
        self.auth = Some(auth);
        Ok(())
    }

    pub fn allowed_algorithms(mut self, algorithms: Vec<String>) -> Self {
        self.allowed_algorithms = algorithms;
        self
    }

    pub fn max_mtu(mut self, mtu: u32) -> NetResult<Self> {
        if mtu < MIN_MTU {
            return Err(Error::Config(format!(
                "max MTU {mtu} below the minimum of {MIN_MTU}"
            )));
        }
        self.max_mtu = mtu;
        Ok(self)
    }

    pub fn metered(mut self, metered: bool) -> Self {
        self.metered = metered;
        self
    }

    pub fn bypassable(mut self, bypassable: bool) -> Self {
        self.bypassable = bypassable;
        self
    }

    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn requires_validation(mut self, requires_validation: bool) -> Self {
        self.requires_validation = requires_validation;
        self
    }

    pub fn automatic_ip_version(mut self, enabled: bool) -> Self {
        self.automatic_ip_version = enabled;
        self
    }

    pub fn automatic_keepalive(mut self, enabled: bool) -> Self {
        self.automatic_keepalive = enabled;
        self
    }

    pub fn restrict_to_test_networks(mut self) -> Self {
        self.restricted_to_test_networks = true;
        self
    }

    pub fn build(self) -> NetResult<VpnProfile> {
        let auth = self
            .auth
            .ok_or_else(|| Error::Config("no authentication mode set".to_string()))?;

        Ok(VpnProfile {
            server_addr: self.server_addr,
            identity: self.identity,
            auth,
            allowed_algorithms: self.allowed_algorithms,
            max_mtu: self.max_mtu,
            metered: self.metered,
            bypassable: self.bypassable,
            proxy: self.proxy,
            requires_validation: self.requires_validation,
            automatic_ip_version: self.automatic_ip_version,
            automatic_keepalive: self.automatic_keepalive,
            restricted_to_test_networks: self.restricted_to_test_networks,
        })
    }
}

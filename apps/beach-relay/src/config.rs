use std::env;
use std::time::Duration;

use crate::session::SessionSettings;

/// What answers offers on the server side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// A server-side `webrtc` peer answers every offer
    Media,
    /// Descriptions and candidates are only stored and relayed
    Relay,
}

impl RelayMode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "media" => Some(RelayMode::Media),
            "relay" => Some(RelayMode::Relay),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub default_session_id: String,
    pub offer_ttl_seconds: u64,
    pub max_sessions: usize,
    pub sweep_interval_seconds: u64,
    pub negotiation_timeout_seconds: Option<u64>,
    pub relay_mode: RelayMode,
    pub room_relay: bool,
    pub ice_servers: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let relay_mode = lookup("RELAY_MODE")
            .and_then(|mode| RelayMode::parse(&mode))
            .unwrap_or(defaults.relay_mode);
        let number = |key: &str| lookup(key).and_then(|val| val.trim().parse::<u64>().ok());

        Self {
            port: lookup("BEACH_RELAY_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            bind_address: lookup("BEACH_RELAY_BIND").unwrap_or(defaults.bind_address),
            default_session_id: lookup("DEFAULT_SESSION_ID")
                .filter(|id| !id.trim().is_empty())
                .unwrap_or(defaults.default_session_id),
            offer_ttl_seconds: number("OFFER_TTL").unwrap_or(defaults.offer_ttl_seconds),
            max_sessions: number("MAX_SESSIONS")
                .map(|n| n as usize)
                .unwrap_or(defaults.max_sessions),
            sweep_interval_seconds: number("SWEEP_INTERVAL")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.sweep_interval_seconds),
            negotiation_timeout_seconds: number("NEGOTIATION_TIMEOUT").filter(|n| *n > 0),
            relay_mode,
            room_relay: lookup("ROOM_RELAY")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(relay_mode == RelayMode::Relay),
            ice_servers: lookup("ICE_SERVERS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|url| !url.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// `None` when offers never expire
    pub fn offer_ttl(&self) -> Option<Duration> {
        (self.offer_ttl_seconds > 0).then(|| Duration::from_secs(self.offer_ttl_seconds))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    /// Room relay only runs when no server-side peer answers offers.
    pub fn room_relay_enabled(&self) -> bool {
        self.room_relay && self.relay_mode == RelayMode::Relay
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            room_relay: self.room_relay_enabled(),
            negotiation_timeout: self.negotiation_timeout_seconds.map(Duration::from_secs),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            default_session_id: "default".to_string(),
            offer_ttl_seconds: 86_400, // one day
            max_sessions: 10_000,
            sweep_interval_seconds: 60,
            negotiation_timeout_seconds: None,
            relay_mode: RelayMode::Media,
            room_relay: false,
            ice_servers: Vec::new(),
        }
    }
}

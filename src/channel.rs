//! Channel configuration and helper.
//!
//! A channel is identified by `(id, protocol)`. [`ChannelConfig`] carries
//! the caller-supplied identity plus the optional handshake payload, and
//! normalizes itself exactly once. The helper functions locate, create,
//! pair, and open substrate channels for a config; the duplex wrapper in
//! [`crate::duplex`] is their only in-crate consumer.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::mux::{ChannelEvent, ChannelKey, Mux};

/// Default protocol namespace for plex channels.
pub const PROTOCOL_BASE: &str = "neonloom/protocol/v1";

/// Caller-provided channel configuration, normalized internally.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    id: Bytes,
    protocol: Option<String>,
    handshake: Option<Bytes>,
    normalized: bool,
}

impl ChannelConfig {
    /// Start a config for the given channel id.
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            protocol: None,
            handshake: None,
            normalized: false,
        }
    }

    /// Use a full protocol string instead of the default namespace.
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Attach a handshake payload sent with the local OPEN.
    pub fn with_handshake(mut self, handshake: impl Into<Bytes>) -> Self {
        self.handshake = Some(handshake.into());
        self
    }

    /// Fill defaults. Idempotent: a normalized config is left untouched.
    pub fn normalize(&mut self) {
        if self.normalized {
            return;
        }
        if self.protocol.is_none() {
            self.protocol = Some(PROTOCOL_BASE.to_string());
        }
        self.normalized = true;
    }

    /// The channel id.
    pub fn id(&self) -> &Bytes {
        &self.id
    }

    /// The protocol string (set after normalization).
    pub fn protocol(&self) -> &str {
        self.protocol.as_deref().unwrap_or(PROTOCOL_BASE)
    }

    /// Handshake payload for the local OPEN; zero-length when unset.
    pub fn handshake(&self) -> Bytes {
        self.handshake.clone().unwrap_or_default()
    }

    /// Substrate key for this config.
    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(self.id.clone(), self.protocol().to_string())
    }
}

/// Locate an existing channel for the config. Returns its key, or `None`.
pub fn get_channel(mux: &Mux, cfg: &ChannelConfig) -> Option<ChannelKey> {
    let key = cfg.key();
    mux.has_channel(&key).then_some(key)
}

/// True iff the substrate reports the config's channel fully open.
pub fn is_open(mux: &Mux, cfg: &ChannelConfig) -> bool {
    mux.is_open(&cfg.key())
}

/// Ensure a channel slot exists for the config.
///
/// Returns the lifecycle-event receiver when this call created the slot;
/// `None` when an earlier `ensure` already claimed it.
pub fn ensure(mux: &Mux, cfg: &ChannelConfig) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
    mux.ensure(&cfg.key())
}

/// Open the local side of the config's channel.
///
/// The handshake payload is the configured message when present, else a
/// zero-length payload.
pub async fn open(mux: &Mux, cfg: &ChannelConfig) -> Result<()> {
    mux.open(&cfg.key(), cfg.handshake()).await
}

/// Register a pair handler: when the remote opens the matching channel,
/// the substrate opens the local side (with the config's handshake) and
/// the channel's open event fires.
pub fn pair(mux: &Mux, cfg: &ChannelConfig) {
    mux.pair(&cfg.key(), cfg.handshake());
}

/// Cancel any outstanding pair registration for the config.
pub fn unpair(mux: &Mux, cfg: &ChannelConfig) {
    mux.unpair(&cfg.key());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FramedDuplex;

    #[test]
    fn test_normalize_fills_default_protocol() {
        let mut cfg = ChannelConfig::new(Bytes::from_static(&[1]));
        cfg.normalize();
        assert_eq!(cfg.protocol(), PROTOCOL_BASE);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let mut cfg = ChannelConfig::new(Bytes::from_static(&[1]))
            .with_protocol("custom/proto");
        cfg.normalize();
        let before = cfg.protocol().to_string();
        cfg.normalize();
        assert_eq!(cfg.protocol(), before);
    }

    #[test]
    fn test_handshake_defaults_to_empty() {
        let cfg = ChannelConfig::new(Bytes::from_static(&[1]));
        assert!(cfg.handshake().is_empty());

        let cfg = cfg.with_handshake(Bytes::from_static(b"hs"));
        assert_eq!(cfg.handshake().as_ref(), b"hs");
    }

    #[tokio::test]
    async fn test_helper_lifecycle() {
        let (a, _b) = FramedDuplex::pair();
        let mux = Mux::attach(a);
        let mut cfg = ChannelConfig::new(Bytes::from_static(&[5]));
        cfg.normalize();

        assert!(get_channel(&mux, &cfg).is_none());
        assert!(!is_open(&mux, &cfg));

        let events = ensure(&mux, &cfg);
        assert!(events.is_some());
        assert!(get_channel(&mux, &cfg).is_some());

        // Re-ensure reuses the existing slot.
        assert!(ensure(&mux, &cfg).is_none());

        open(&mux, &cfg).await.unwrap();
        // Remote never opened, so the channel is not fully open yet.
        assert!(!is_open(&mux, &cfg));
    }
}

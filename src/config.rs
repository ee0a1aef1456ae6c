use uuid::Uuid;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Configuration for one signaling session and the peer connections it
/// negotiates.
#[derive(Clone, Debug)]
pub struct CallConfig {
    /// Base URL of the signaling server.
    pub signaling_base: String,
    /// Identity announced on the signaling channel and stamped on every
    /// outbound envelope.
    pub identity: String,
    /// ICE server URLs handed to the media engine.
    pub ice_servers: Vec<String>,
}

impl CallConfig {
    pub fn new(signaling_base: impl Into<String>, identity: Option<String>) -> Self {
        let ice_servers = if std::env::var("COVE_LOCALHOST_ONLY").is_ok() {
            Vec::new()
        } else {
            vec![DEFAULT_STUN_SERVER.to_string()]
        };
        Self {
            signaling_base: signaling_base.into(),
            identity: identity.unwrap_or_else(|| Uuid::new_v4().to_string()),
            ice_servers,
        }
    }

    /// No STUN/TURN; candidates stay on local interfaces.
    pub fn localhost(signaling_base: impl Into<String>, identity: Option<String>) -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::new(signaling_base, identity)
        }
    }

    pub fn with_ice_servers(mut self, urls: Vec<String>) -> Self {
        if !urls.is_empty() {
            self.ice_servers = urls;
        }
        self
    }
}

use std::time::Duration;
use tracing::warn;
use tw_core::Credential;
use tw_sync::SyncTuning;
use url::Url;

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000/api/v1";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base: Url,
    pub ws_base: Url,
    pub credential: Credential,
    pub tuning: SyncTuning,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(api_base: Url, ws_base: Option<Url>, credential: Credential) -> Self {
        let ws_base = ws_base.unwrap_or_else(|| derive_ws_base(&api_base));
        Self {
            api_base,
            ws_base,
            credential,
            tuning: SyncTuning::default(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

/// Same host and path as the REST base, with the websocket scheme.
pub fn derive_ws_base(api_base: &Url) -> Url {
    let mut ws_base = api_base.clone();
    let scheme = if api_base.scheme() == "https" {
        "wss"
    } else {
        "ws"
    };
    if ws_base.set_scheme(scheme).is_err() {
        warn!(event = "ws_base_derive_failed", api_base = %api_base);
    }
    ws_base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_base_follows_api_scheme() {
        let plain = Url::parse("http://127.0.0.1:8000/api/v1").expect("url");
        assert_eq!(derive_ws_base(&plain).as_str(), "ws://127.0.0.1:8000/api/v1");
        let tls = Url::parse("https://soc.example/api/v1").expect("url");
        assert_eq!(derive_ws_base(&tls).as_str(), "wss://soc.example/api/v1");
    }

    #[test]
    fn explicit_ws_base_wins() {
        let api = Url::parse("http://127.0.0.1:8000/api/v1").expect("url");
        let ws = Url::parse("ws://10.0.0.2:9000/api/v1").expect("url");
        let config = ClientConfig::new(api, Some(ws.clone()), Credential::new("t"));
        assert_eq!(config.ws_base, ws);
        assert_eq!(config.tuning, SyncTuning::default());
    }
}

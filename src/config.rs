use callcore::ReconnectPolicy;
use std::time::Duration;

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080";

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server_url: String,
    pub reconnect: ReconnectPolicy,
    /// Upper bound on resolving the local identity during `connect()`.
    pub identity_timeout: Duration,
    /// Delay before the single retry of a send that found no live socket.
    pub send_retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            reconnect: ReconnectPolicy::default(),
            identity_timeout: Duration::from_secs(5),
            send_retry_delay: Duration::from_millis(100),
        }
    }
}

impl ClientConfig {
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }
}

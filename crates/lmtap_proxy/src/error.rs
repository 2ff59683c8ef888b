use thiserror::Error;

/// Terminal failure of one proxied request, handed to the interceptor's
/// error hook.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("upstream returned status code {0}")]
    UpstreamStatus(u16),

    #[error("error relaying upstream body: {0}")]
    Body(String),

    #[error("client disconnected before the response completed")]
    ClientDisconnected,
}

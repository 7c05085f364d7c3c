use std::path::PathBuf;
use std::time::Duration;

/// Transport scheme served by a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// Address family restriction for binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    Inet,
    Inet6,
    Unspec,
}

/// Peer certificate requirements for TLS listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertReqs {
    None,
    Optional,
    Required,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Server certificate chain, PEM.
    pub certfile: PathBuf,
    /// Private key, PEM.
    pub keyfile: PathBuf,
    /// Concatenated CA certificates used to validate peer certificates.
    pub ca_certs: Option<PathBuf>,
    pub cert_reqs: CertReqs,
}

/// Settings consumed by the server core.
///
/// ```
/// use ember_http::ServerConfig;
///
/// let mut config = ServerConfig::default();
/// config.port = Some(0); // bind an ephemeral port
/// config.max_buffer_size = 64 * 1024;
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub scheme: Scheme,
    /// IP address or hostname; an empty string listens on all interfaces.
    pub host: String,
    /// Port to bind. Left unset, the scheme's well-known port (80 or
    /// 443) is used; `Some(0)` binds an OS-assigned ephemeral port.
    pub port: Option<u16>,
    pub family: AddrFamily,
    /// Passed through to `listen(2)`.
    pub backlog: i32,
    /// When set, the dispatcher is expected to honor `X-Real-Ip` and
    /// `X-Scheme` headers from a fronting proxy. The core ignores it.
    pub xheaders: bool,
    /// Warning limit for the number of descriptors a reactor polls.
    pub poll_threshold: usize,
    /// Default wait of one poll cycle when nothing is due earlier.
    pub poll_timeout: Duration,
    /// Idle connections are dropped after this long.
    pub connection_timeout: Duration,
    /// Per-stream read-buffer and request-body ceiling, in bytes.
    pub max_buffer_size: usize,
    /// Bytes asked of the socket per read attempt.
    pub read_chunk_size: usize,
    /// Close the connection after every response.
    pub no_keep_alive: bool,
    /// Required when `scheme` is `Https`.
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            scheme: Scheme::Http,
            host: "localhost".to_string(),
            port: None,
            family: AddrFamily::Inet,
            backlog: 128,
            xheaders: false,
            poll_threshold: 1000,
            poll_timeout: Duration::from_secs(3600),
            connection_timeout: Duration::from_secs(3600),
            max_buffer_size: 100 * 1024 * 1024,
            read_chunk_size: 4096,
            no_keep_alive: false,
            tls: None,
        }
    }
}

use crate::config::{BasicAuthConfig, WebConfig};
use crate::error::LbError;
use crate::frontend::context::BoxBody;
use base64::Engine;
use http::header::AUTHORIZATION;
use http::{HeaderValue, Uri};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// A rustls `ServerCertVerifier` that accepts any certificate without
/// validation. Used when `tls_verify: false` — the common case for internal
/// backends where encryption is desired but identity verification is not.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// One upstream query server.
///
/// Holds the mutable runtime state the monitor and dispatcher share: the
/// alive flag, the active-connection counter, and the advertised retention
/// window. The reverse-proxy transport is built once per backend and reused
/// for every request.
pub struct Backend {
    url: Url,

    /// Pre-computed "host:port" — the health monitor dials this on every
    /// round; avoids re-deriving it per probe.
    dial_addr: String,

    client: Client<HttpsConnector<HttpConnector>, BoxBody>,

    /// Pre-encoded Basic credentials from the backend's web config, set on
    /// every outbound request when present.
    authorization: Option<HeaderValue>,

    alive: AtomicBool,
    active: AtomicUsize,

    /// Advertised retention window in seconds; 0 until the runtime-info
    /// probe succeeds.
    retention_secs: AtomicU64,
}

impl Backend {
    pub fn new(web: &WebConfig) -> Result<Self, LbError> {
        let url = Url::parse(&web.url)
            .map_err(|e| LbError::Config(format!("malformed backend url {:?}: {}", web.url, e)))?;

        let host = url
            .host_str()
            .ok_or_else(|| LbError::Config(format!("backend url {:?} has no host", web.url)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| LbError::Config(format!("backend url {:?} has no port", web.url)))?;
        let dial_addr = format!("{}:{}", host, port);

        let authorization = web
            .basic_auth
            .as_ref()
            .map(basic_auth_header)
            .transpose()?;

        Ok(Self {
            url,
            dial_addr,
            client: build_backend_client(web.tls_verify),
            authorization,
            // Optimistic until the first health round says otherwise.
            alive: AtomicBool::new(true),
            active: AtomicUsize::new(0),
            retention_secs: AtomicU64::new(0),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// "host:port" the health monitor dials.
    pub fn dial_addr(&self) -> &str {
        &self.dial_addr
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs.load(Ordering::Relaxed))
    }

    pub fn set_retention(&self, retention: Duration) {
        self.retention_secs
            .store(retention.as_secs(), Ordering::Relaxed);
    }

    /// Forward a request to this backend. The inbound path and query are
    /// appended to the backend's base path; beyond the configured Basic
    /// credentials nothing else about the request is rewritten here.
    ///
    /// The active-connection counter covers the window from dispatch until
    /// the upstream response head arrives.
    pub async fn serve(&self, mut req: Request<BoxBody>) -> Result<Response<Incoming>, LbError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        *req.uri_mut() = self.upstream_uri(path_and_query)?;

        if let Some(ref authorization) = self.authorization {
            req.headers_mut()
                .insert(AUTHORIZATION, authorization.clone());
        }

        self.active.fetch_add(1, Ordering::Relaxed);
        let result = self.client.request(req).await;
        self.active.fetch_sub(1, Ordering::Relaxed);

        result.map_err(|e| LbError::Upstream(e.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn inc_active_for_tests(&self, n: usize) {
        self.active.fetch_add(n, Ordering::Relaxed);
    }

    /// "{scheme}://{host:port}{base_path}{path_and_query}", preserving the
    /// inbound path and raw query verbatim.
    fn upstream_uri(&self, path_and_query: &str) -> Result<Uri, LbError> {
        let base_path = self.url.path().trim_end_matches('/');
        let mut buf =
            String::with_capacity(self.url.as_str().len() + base_path.len() + path_and_query.len());
        buf.push_str(self.url.scheme());
        buf.push_str("://");
        buf.push_str(&self.dial_addr);
        buf.push_str(base_path);
        buf.push_str(path_and_query);

        buf.parse::<Uri>()
            .map_err(|e| LbError::Internal(format!("failed to build upstream uri: {}", e)))
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend[{}]", self.url)
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("url", &self.url.as_str())
            .field("alive", &self.is_alive())
            .field("active", &self.active_connections())
            .field("retention_secs", &self.retention().as_secs())
            .finish()
    }
}

/// "Basic {base64(username:password)}" per RFC 7617.
fn basic_auth_header(auth: &BasicAuthConfig) -> Result<HeaderValue, LbError> {
    let credentials = format!("{}:{}", auth.username, auth.password);
    let encoded = base64::engine::general_purpose::STANDARD.encode(credentials.as_bytes());
    let mut value = HeaderValue::from_str(&format!("Basic {}", encoded))
        .map_err(|e| LbError::Config(format!("invalid basic auth credentials: {}", e)))?;
    value.set_sensitive(true);
    Ok(value)
}

#[cfg(test)]
pub fn test_backend(url: &str) -> Arc<Backend> {
    Arc::new(
        Backend::new(&WebConfig {
            url: url.to_string(),
            tls_verify: false,
            basic_auth: None,
        })
        .unwrap(),
    )
}

/// Build a hyper `Client` that supports both HTTP and HTTPS backends.
///
/// - Plain `http://` connections go through the inner `HttpConnector`.
/// - `https://` connections are terminated with rustls (ring backend).
/// - When `tls_verify` is `false` (the default), certificate validation is
///   skipped — suitable for internal backends with self-signed certs.
pub(crate) fn build_backend_client(tls_verify: bool) -> Client<HttpsConnector<HttpConnector>, BoxBody> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_connect_timeout(Some(Duration::from_secs(5)));
    http.enforce_http(false);

    let https = if tls_verify {
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    } else {
        let tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();

        hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http)
    };

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(60))
        .build(https)
}

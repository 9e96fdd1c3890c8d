use std::sync::Once;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, StatusCode};
use http::response::Parts;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::Value as JsonValue;
use tokio::time::Instant;

use crate::error::ExternalCallError;

static INSTALL_CRYPTO: Once = Once::new();

fn install_crypto_provider() {
    INSTALL_CRYPTO.call_once(|| {
        // Fails only if another provider was installed first, which is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Connection settings for the shared client.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Maximum idle connections kept per host.
    pub pool_size: usize,
    /// Upper bound for one request including the body read. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Number of workers sharing the client; sizes the HTTP/2 windows.
    pub workers: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            pool_size: 2000,
            timeout: Some(Duration::from_secs(60)),
            workers: 1000,
        }
    }
}

/// One outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, url).body(body)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Approximate bytes on the wire for an HTTP/1.1 request line, headers and body.
    fn wire_size(&self) -> usize {
        let mut size = self.method.as_str().len() + 1 + self.url.len() + 11;
        for (k, v) in &self.headers {
            size += k.len() + 2 + v.len() + 2;
        }
        size + 2 + self.body.len()
    }

    fn to_hyper(&self) -> Result<Request<Full<Bytes>>, ExternalCallError> {
        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(self.url.as_str());
        for (k, v) in &self.headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| ExternalCallError::InvalidRequest(format!("header '{}': {}", k, e)))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| ExternalCallError::InvalidRequest(format!("header '{}': {}", k, e)))?;
            builder = builder.header(name, value);
        }
        builder
            .body(Full::new(self.body.clone()))
            .map_err(|e| ExternalCallError::InvalidRequest(format!("{} {}: {}", self.method, self.url, e)))
    }
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Time from sending the request to the last body byte.
    pub duration: Duration,
    pub bytes_sent: usize,
    pub bytes_received: usize,
}

impl HttpResponse {
    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Pooled HTTP/1.1 + HTTP/2 client shared by every worker. Cheap to clone.
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Option<Duration>,
}

impl HttpClient {
    pub fn new(settings: &HttpSettings) -> Self {
        install_crypto_provider();

        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let builder = match hyper_rustls::HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                tracing::warn!(error = %e, "no native root certificates found, https targets will fail verification");
                let config = rustls::ClientConfig::builder()
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth();
                hyper_rustls::HttpsConnectorBuilder::new().with_tls_config(config)
            }
        };
        let https = builder
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        // Smaller HTTP/2 windows at high worker counts to bound memory.
        let (conn_window, stream_window) = if settings.workers > 5000 {
            (128 * 1024, 64 * 1024)
        } else if settings.workers > 2000 {
            (256 * 1024, 128 * 1024)
        } else {
            (512 * 1024, 256 * 1024)
        };

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(settings.pool_size)
            .http2_initial_connection_window_size(conn_window)
            .http2_initial_stream_window_size(stream_window)
            .build(https);

        Self {
            client,
            timeout: settings.timeout,
        }
    }

    /// Send `req` and read the whole body. Must be called inside a tokio runtime.
    pub async fn request(&self, req: &HttpRequest) -> Result<HttpResponse, ExternalCallError> {
        let hyper_req = req.to_hyper()?;
        let bytes_sent = req.wire_size();
        let start = Instant::now();

        let exchange = async {
            let response = self
                .client
                .request(hyper_req)
                .await
                .map_err(|e| ExternalCallError::Transport(error_chain(&e)))?;
            read_response(response).await
        };

        let (parts, body) = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| ExternalCallError::Timeout(limit))??,
            None => exchange.await?,
        };
        let duration = start.elapsed();

        // Status line + headers + terminating CRLF + body.
        let mut bytes_received = 15 + 2 + body.len();
        for (k, v) in parts.headers.iter() {
            bytes_received += k.as_str().len() + 2 + v.len() + 2;
        }

        Ok(HttpResponse {
            status: parts.status,
            headers: parts.headers,
            body,
            duration,
            bytes_sent,
            bytes_received,
        })
    }
}

/// Split off the head and buffer the streamed body.
async fn read_response(response: hyper::Response<Incoming>) -> Result<(Parts, Bytes), ExternalCallError> {
    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| ExternalCallError::Transport(error_chain(&e)))?
        .to_bytes();
    Ok((parts, body))
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

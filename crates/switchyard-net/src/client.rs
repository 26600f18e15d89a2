//! Minimal HTTPS client
//!
//! hyper HTTP/1.1 over rustls with the webpki root store. One connection
//! per request; the credential API is called a handful of times per
//! connect, so pooling buys nothing.

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Bytes;
use hyper::header::{ACCEPT, CONTENT_TYPE, HOST, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use hyper::{Method, Request, StatusCode, Uri};
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// HTTP client errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timeout")]
    Timeout,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Body read error: {0}")]
    Body(String),
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Whole-request timeout, connect included
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    /// Responses larger than this fail with [`HttpError::Body`]
    pub max_body_size: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            user_agent: format!("switchyard/{}", env!("CARGO_PKG_VERSION")),
            max_body_size: 1024 * 1024,
        }
    }
}

/// HTTP response
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub elapsed: Duration,
}

impl Response {
    /// Check if response was successful (2xx)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.clone())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE)?.to_str().ok()
    }
}

pub struct HttpClient {
    config: HttpClientConfig,
    tls: TlsConnector,
    /// Sent with every request (session token and the like)
    default_headers: HeaderMap,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        info!("HTTP client initialized (timeout: {:?})", config.timeout);

        Self {
            config,
            tls: TlsConnector::from(Arc::new(tls_config)),
            default_headers: HeaderMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(HttpClientConfig::default())
    }

    /// Add a header sent with every request
    pub fn set_default_header(&mut self, name: &'static str, value: &str) -> Result<(), HttpError> {
        let value = HeaderValue::from_str(value).map_err(|e| HttpError::Http(e.to_string()))?;
        self.default_headers.insert(HeaderName::from_static(name), value);
        Ok(())
    }

    pub async fn get(&self, url: &str) -> Result<Response, HttpError> {
        self.request(Method::GET, url, None).await
    }

    pub async fn post(&self, url: &str, body: Vec<u8>) -> Result<Response, HttpError> {
        self.request(Method::POST, url, Some(body)).await
    }

    /// Perform a request bounded by the configured timeout
    pub async fn request(&self, method: Method, url: &str, body: Option<Vec<u8>>) -> Result<Response, HttpError> {
        tokio::time::timeout(self.config.timeout, self.send(method, url, body))
            .await
            .map_err(|_| HttpError::Timeout)?
    }

    async fn send(&self, method: Method, url: &str, body: Option<Vec<u8>>) -> Result<Response, HttpError> {
        let start = Instant::now();

        let uri: Uri = url
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| HttpError::InvalidUrl(e.to_string()))?;
        let host = uri
            .host()
            .ok_or_else(|| HttpError::InvalidUrl("No host in URL".to_string()))?
            .to_string();
        let is_https = uri.scheme_str() == Some("https");
        let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header(USER_AGENT, &self.config.user_agent)
            .header(ACCEPT, "application/json")
            .header(HOST, &host);
        for (name, value) in &self.default_headers {
            builder = builder.header(name, value);
        }
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| HttpError::Http(e.to_string()))?;

        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| HttpError::Timeout)?
            .map_err(|e| HttpError::ConnectionFailed(e.to_string()))?;

        let response = if is_https {
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|_| HttpError::Tls("Invalid server name".to_string()))?;
            let tls_stream = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(|e| HttpError::Tls(e.to_string()))?;
            Self::exchange(hyper_util::rt::TokioIo::new(tls_stream), request).await?
        } else {
            Self::exchange(hyper_util::rt::TokioIo::new(stream), request).await?
        };

        let status = response.status();
        let headers = response.headers().clone();
        let collected = Limited::new(response.into_body(), self.config.max_body_size)
            .collect()
            .await
            .map_err(|e| HttpError::Body(e.to_string()))?;
        let body = collected.to_bytes().to_vec();

        debug!("HTTP {} {} -> {} ({} bytes)", method, url, status, body.len());

        Ok(Response {
            status,
            headers,
            body,
            elapsed: start.elapsed(),
        })
    }

    async fn exchange<T>(
        io: hyper_util::rt::TokioIo<T>,
        request: Request<Full<Bytes>>,
    ) -> Result<hyper::Response<hyper::body::Incoming>, HttpError>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| HttpError::Http(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!("Connection error: {}", e);
            }
        });

        sender
            .send_request(request)
            .await
            .map_err(|e| HttpError::Http(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url() {
        let client = HttpClient::with_defaults();
        let result = client.get("not a url").await;
        assert!(matches!(result, Err(HttpError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_missing_host() {
        let client = HttpClient::with_defaults();
        let result = client.get("/v1/credentials").await;
        assert!(matches!(result, Err(HttpError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = HttpClient::with_defaults();
        let result = client.get(&format!("http://127.0.0.1:{}/", port)).await;
        assert!(matches!(result, Err(HttpError::ConnectionFailed(_))));
    }

    #[test]
    fn test_default_header_validation() {
        let mut client = HttpClient::with_defaults();
        assert!(client.set_default_header("authorization", "Bearer abc").is_ok());
        assert!(client.set_default_header("authorization", "bad\nvalue").is_err());
    }
}

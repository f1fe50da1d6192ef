use std::time::Duration;

use bytes::Bytes;
use http::Request;
use http::header::CONTENT_LENGTH;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tracing::debug;

#[cfg(feature = "tls-rustls-ring")]
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};

use super::{Transport, TransportError, TransportFuture, TransportRequest, TransportResponse};
use crate::error::TransportErrorKind;

const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;

type PlainClient = Client<HttpConnector, Full<Bytes>>;
#[cfg(feature = "tls-rustls-ring")]
type RustlsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

#[derive(Clone)]
enum TransportClient {
    Plain(PlainClient),
    #[cfg(feature = "tls-rustls-ring")]
    Rustls(RustlsClient),
}

impl TransportClient {
    async fn request(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<http::Response<Incoming>, hyper_util::client::legacy::Error> {
        match self {
            Self::Plain(client) => client.request(request).await,
            #[cfg(feature = "tls-rustls-ring")]
            Self::Rustls(client) => client.request(request).await,
        }
    }
}

/// [`Transport`] over the hyper-util pooled client (HTTP/1.1 and HTTP/2).
#[derive(Clone)]
pub struct HyperTransport {
    client: TransportClient,
    max_response_body_bytes: usize,
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self.client {
            TransportClient::Plain(_) => "plain",
            #[cfg(feature = "tls-rustls-ring")]
            TransportClient::Rustls(_) => "rustls-ring",
        };
        formatter
            .debug_struct("HyperTransport")
            .field("backend", &backend)
            .field("max_response_body_bytes", &self.max_response_body_bytes)
            .finish()
    }
}

impl HyperTransport {
    pub fn builder() -> HyperTransportBuilder {
        HyperTransportBuilder::default()
    }

    /// Cleartext `http://` only.
    pub fn plain() -> Self {
        Self::builder().build_plain()
    }

    #[cfg(feature = "tls-rustls-ring")]
    pub fn new() -> crate::Result<Self> {
        Self::builder().build()
    }
}

#[derive(Clone, Debug)]
pub struct HyperTransportBuilder {
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
    connect_timeout: Duration,
    max_response_body_bytes: usize,
    http2_only: bool,
}

impl Default for HyperTransportBuilder {
    fn default() -> Self {
        Self {
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            http2_only: false,
        }
    }
}

impl HyperTransportBuilder {
    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout;
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn http2_only(mut self, http2_only: bool) -> Self {
        self.http2_only = http2_only;
        self
    }

    fn http_connector(&self) -> HttpConnector {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(self.connect_timeout));
        connector
    }

    fn client_builder(&self) -> hyper_util::client::legacy::Builder {
        let mut builder = Client::builder(TokioExecutor::new());
        builder
            .pool_idle_timeout(self.pool_idle_timeout)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .http2_only(self.http2_only);
        builder
    }

    pub fn build_plain(self) -> HyperTransport {
        let client = self.client_builder().build(self.http_connector());
        HyperTransport {
            client: TransportClient::Plain(client),
            max_response_body_bytes: self.max_response_body_bytes,
        }
    }

    #[cfg(feature = "tls-rustls-ring")]
    pub fn build(self) -> crate::Result<HyperTransport> {
        let mut connector = self.http_connector();
        connector.enforce_http(false);
        let https = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|source| crate::Error::TransportInit {
                message: source.to_string(),
            })?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);
        let client = self.client_builder().build(https);
        Ok(HyperTransport {
            client: TransportClient::Rustls(client),
            max_response_body_bytes: self.max_response_body_bytes,
        })
    }
}

impl Transport for HyperTransport {
    fn send(&self, request: TransportRequest) -> TransportFuture {
        let client = self.client.clone();
        let max_response_body_bytes = self.max_response_body_bytes;
        Box::pin(async move {
            let timeout_value = request.timeout;
            match timeout(
                timeout_value,
                execute(client, request, max_response_body_bytes),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout {
                    timeout_ms: timeout_value.as_millis(),
                }),
            }
        })
    }
}

async fn execute(
    client: TransportClient,
    request: TransportRequest,
    max_response_body_bytes: usize,
) -> Result<TransportResponse, TransportError> {
    let TransportRequest {
        method,
        uri,
        headers,
        body,
        progress,
        ..
    } = request;

    let mut request_builder = Request::builder().method(method).uri(uri);
    for (name, value) in &headers {
        request_builder = request_builder.header(name, value);
    }
    let http_request = request_builder
        .body(Full::new(body))
        .map_err(|source| TransportError::other(TransportErrorKind::Other, source))?;

    let response = client.request(http_request).await.map_err(|source| {
        let kind = classify_transport_error(&source);
        TransportError::other(kind, source)
    })?;
    let (parts, mut incoming) = response.into_parts();
    let expected_len = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|len| *len > 0);

    let mut collected = Vec::new();
    while let Some(frame) = incoming.frame().await {
        let frame =
            frame.map_err(|source| TransportError::other(TransportErrorKind::Read, source))?;
        let Some(data) = frame.data_ref() else {
            continue;
        };
        if collected.len().saturating_add(data.len()) > max_response_body_bytes {
            return Err(TransportError::other(
                TransportErrorKind::BodyTooLarge,
                format!("response body exceeds {max_response_body_bytes} bytes"),
            ));
        }
        collected.extend_from_slice(data);
        if let Some(expected_len) = expected_len {
            progress.report(collected.len() as f64 / expected_len as f64);
        }
    }
    progress.report(1.0);

    debug!(
        status = parts.status.as_u16(),
        body_bytes = collected.len(),
        "transport exchange completed"
    );
    Ok(TransportResponse::new(
        parts.status,
        parts.headers,
        Bytes::from(collected),
    ))
}

fn classify_transport_error(error: &hyper_util::client::legacy::Error) -> TransportErrorKind {
    let text = error.to_string().to_ascii_lowercase();
    if error.is_connect() {
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }

    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
    {
        return TransportErrorKind::Read;
    }
    TransportErrorKind::Other
}

use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Uri};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cancel::CancellationScope;
use crate::error::Error;
use crate::fingerprint::RequestFingerprint;
use crate::transport::Progress;
use crate::util::{parse_header_name, parse_header_value, redact_uri_for_logs, resolve_url};

/// A request as the caller describes it, before dispatch.
///
/// The query string is held as separate pairs so that pair order does not
/// change the request's identity for duplicate suppression. Descriptors
/// are cheap to clone; clones share the cancellation token and progress sink.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    method: Method,
    url: url::Url,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
    timeout: Option<Duration>,
    skip_dedup: bool,
    recovery_exempt: bool,
    cache_key: Option<String>,
    cancellation: Option<CancellationToken>,
    progress: Progress,
}

impl RequestDescriptor {
    /// `url` must be an absolute `http(s)` URL. Any query it carries is split
    /// into pairs.
    pub fn new(method: Method, url: &str) -> crate::Result<Self> {
        Ok(Self::from_url(method, resolve_url(None, url)?))
    }

    pub fn get(url: &str) -> crate::Result<Self> {
        Self::new(Method::GET, url)
    }

    pub fn post(url: &str) -> crate::Result<Self> {
        Self::new(Method::POST, url)
    }

    pub(crate) fn from_url(method: Method, mut url: url::Url) -> Self {
        let query_pairs = url
            .query_pairs()
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        url.set_query(None);
        url.set_fragment(None);
        Self {
            method,
            url,
            query_pairs,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            timeout: None,
            skip_dedup: false,
            recovery_exempt: false,
            cache_key: None,
            cancellation: None,
            progress: Progress::disabled(),
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query_pairs<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.query_pairs.extend(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into())),
        );
        self
    }

    pub fn query<T>(mut self, params: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params)
            .map_err(|source| Error::SerializeQuery { source })?;
        self.query_pairs.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json<T>(self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| Error::SerializeJson { source })?;
        Ok(self
            .body(body)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    pub fn form<T>(self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(payload)
            .map_err(|source| Error::SerializeForm { source })?;
        Ok(self.body(encoded).header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        ))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    /// Exempts the request from duplicate suppression.
    pub fn skip_dedup(mut self) -> Self {
        self.skip_dedup = true;
        self
    }

    /// Marks the request as one that must never wait on credential recovery,
    /// typically the refresh call itself.
    pub fn recovery_exempt(mut self) -> Self {
        self.recovery_exempt = true;
        self
    }

    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn cancel_with(mut self, scope: &CancellationScope) -> Self {
        self.cancellation = Some(scope.token());
        self
    }

    /// Download progress in `[0, 1]`, never decreasing, including across a
    /// replay after credential recovery.
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        self.progress = Progress::new(callback);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The resolved URL without its query.
    pub fn url(&self) -> &url::Url {
        &self.url
    }

    pub fn query_pairs_ref(&self) -> &[(String, String)] {
        &self.query_pairs
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn configured_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_dedup_skipped(&self) -> bool {
        self.skip_dedup
    }

    pub fn is_recovery_exempt(&self) -> bool {
        self.recovery_exempt
    }

    pub fn configured_cache_key(&self) -> Option<&str> {
        self.cache_key.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    pub(crate) fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    pub(crate) fn progress(&self) -> &Progress {
        &self.progress
    }

    pub(crate) fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub(crate) fn fingerprint(&self) -> RequestFingerprint {
        RequestFingerprint::compute(&self.method, self.url.as_str(), &self.query_pairs, &self.body)
    }

    pub(crate) fn redacted_uri(&self) -> String {
        redact_uri_for_logs(self.url.as_str())
    }

    pub(crate) fn uri_with_query(&self) -> crate::Result<Uri> {
        let mut url = self.url.clone();
        if !self.query_pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.query_pairs);
        }
        Uri::try_from(url.as_str()).map_err(|_| Error::InvalidUri {
            uri: self.redacted_uri(),
        })
    }
}

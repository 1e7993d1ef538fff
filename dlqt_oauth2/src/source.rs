//! Where published key sets come from

use std::{
    error::Error as StdError,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dlqt_auth::KeySet;
use thiserror::Error;

use crate::TenantIdRef;

/// A failure to obtain a key set from the identity provider
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request could not be sent or the connection failed
    #[error("key set request failed")]
    Request(#[source] Box<dyn StdError + Send + Sync + 'static>),

    /// The endpoint answered with a non-success status
    #[error("key set endpoint responded with status {status}")]
    Status {
        /// HTTP status code
        status: u16,
    },

    /// The response body was not a key set
    #[error("key set response body was malformed")]
    Body(#[source] Box<dyn StdError + Send + Sync + 'static>),

    /// The request did not complete in time
    #[error("key set request timed out after {0:?}")]
    Timeout(Duration),

    /// A refresh was attempted too recently and was not retried
    #[error("key set refresh throttled after a recent attempt")]
    Throttled,
}

/// Conditional request validators from a previous response
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheValidators {
    /// The `ETag` of the cached key set
    pub etag: Option<String>,

    /// The `Last-Modified` time of the cached key set
    pub last_modified: Option<String>,
}

impl CacheValidators {
    /// Whether there is anything to send in a conditional request
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// The outcome of a key set fetch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fetched {
    /// A new key set
    Keys {
        /// The published keys
        keys: KeySet,
        /// Validators to send on the next fetch
        validators: CacheValidators,
    },

    /// The key set is unchanged since the validators were issued
    NotModified,
}

/// A source of published key sets, one per tenant
#[async_trait]
pub trait KeySource: fmt::Debug + Send + Sync {
    /// Fetches the current key set for `tenant`
    ///
    /// When `cached` validators are given, the source may answer
    /// [`Fetched::NotModified`] instead of returning the same keys again.
    async fn fetch(
        &self,
        tenant: &TenantIdRef,
        cached: Option<&CacheValidators>,
    ) -> Result<Fetched, FetchError>;
}

#[async_trait]
impl<T: KeySource + ?Sized> KeySource for Arc<T> {
    async fn fetch(
        &self,
        tenant: &TenantIdRef,
        cached: Option<&CacheValidators>,
    ) -> Result<Fetched, FetchError> {
        T::fetch(self, tenant, cached).await
    }
}

/// Fetches key sets over HTTPS from `https://{host}/{tenant}/discovery/v2.0/keys`
#[cfg(feature = "reqwest")]
#[derive(Clone, Debug)]
pub struct HttpKeySource {
    base_url: String,
    client: reqwest::Client,
}

#[cfg(feature = "reqwest")]
impl HttpKeySource {
    /// A source for the identity provider at `host`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(host: &str) -> Result<Self, reqwest::Error> {
        Self::with_base_url(format!("https://{host}"))
    }

    /// A source rooted at an arbitrary base URL, such as a local mock
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("dlqt_oauth2/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self::with_client(base_url, client))
    }

    /// A source using a preconfigured client
    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url, client }
    }

    /// The key set URL for `tenant`
    #[must_use]
    pub fn keys_url(&self, tenant: &TenantIdRef) -> String {
        format!("{}/{tenant}/discovery/v2.0/keys", self.base_url)
    }
}

#[cfg(feature = "reqwest")]
#[async_trait]
impl KeySource for HttpKeySource {
    #[tracing::instrument(skip(self, cached), fields(jwks.url = tracing::field::Empty))]
    async fn fetch(
        &self,
        tenant: &TenantIdRef,
        cached: Option<&CacheValidators>,
    ) -> Result<Fetched, FetchError> {
        use reqwest::{header, StatusCode};

        let url = self.keys_url(tenant);
        tracing::Span::current().record("jwks.url", url.as_str());
        tracing::debug!("fetching key set");

        let mut request = self.client.get(&url);
        if let Some(cached) = cached {
            if let Some(etag) = &cached.etag {
                request = request.header(header::IF_NONE_MATCH, etag.as_str());
            } else if let Some(last_modified) = &cached.last_modified {
                request = request.header(header::IF_MODIFIED_SINCE, last_modified.as_str());
            }
        }

        let response = request.send().await.map_err(|err| {
            let error: &dyn StdError = &err;
            tracing::warn!(error, "key set request failed");
            FetchError::Request(Box::new(err))
        })?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED && cached.map_or(false, |c| !c.is_empty()) {
            tracing::debug!("key set not modified");
            return Ok(Fetched::NotModified);
        } else if !status.is_success() {
            tracing::warn!(
                http.status_code = status.as_u16(),
                "key set fetch failed; unexpected response status",
            );
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let header_string = |name: header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(ToOwned::to_owned)
        };
        let validators = CacheValidators {
            etag: header_string(header::ETAG),
            last_modified: header_string(header::LAST_MODIFIED),
        };

        match response.json::<KeySet>().await {
            Ok(keys) => Ok(Fetched::Keys { keys, validators }),
            Err(err) => {
                let error: &dyn StdError = &err;
                tracing::warn!(error, "key set fetch failed; malformed body");
                Err(FetchError::Body(Box::new(err)))
            }
        }
    }
}

/// Serves a fixed key set to every tenant
///
/// Used for offline runs and as a test double. It counts fetches, and can
/// be told to simulate latency or an outage.
#[derive(Debug)]
pub struct StaticKeySource {
    keys: ArcSwap<KeySet>,
    fetches: AtomicUsize,
    unavailable: AtomicBool,
    latency: Option<Duration>,
}

impl StaticKeySource {
    /// A source publishing `keys`
    #[must_use]
    pub fn new(keys: KeySet) -> Self {
        Self {
            keys: ArcSwap::from_pointee(keys),
            fetches: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
            latency: None,
        }
    }

    /// Delays every fetch by `latency`
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Replaces the published keys, as a provider does when rotating
    pub fn set_keys(&self, keys: KeySet) {
        self.keys.store(Arc::new(keys));
    }

    /// Makes subsequent fetches fail with `503 Service Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The number of fetches served or failed so far
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn fetch(
        &self,
        _tenant: &TenantIdRef,
        _cached: Option<&CacheValidators>,
    ) -> Result<Fetched, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FetchError::Status { status: 503 });
        }

        Ok(Fetched::Keys {
            keys: KeySet::clone(&self.keys.load()),
            validators: CacheValidators::default(),
        })
    }
}

#[cfg(all(test, feature = "reqwest"))]
mod tests {
    use color_eyre::Result;
    use dlqt_auth::testing;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::TenantId;

    fn tenant() -> TenantId {
        TenantId::from_static(testing::TENANT)
    }

    fn keys_path() -> String {
        format!("/{}/discovery/v2.0/keys", testing::TENANT)
    }

    #[test]
    fn builds_tenant_keys_url() -> Result<()> {
        let source = HttpKeySource::new(testing::AUTHORITY_HOST)?;
        assert_eq!(
            source.keys_url(&tenant()),
            format!(
                "https://login.microsoftonline.com/{}/discovery/v2.0/keys",
                testing::TENANT
            )
        );
        Ok(())
    }

    #[tokio::test]
    async fn fetches_and_records_validators() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(keys_path()))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "\"v1\"")
                    .set_body_raw(testing::JWKS, "application/json"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let source = HttpKeySource::with_base_url(server.uri())?;
        let fetched = source.fetch(&tenant(), None).await?;

        match fetched {
            Fetched::Keys { keys, validators } => {
                assert_eq!(keys, testing::key_set());
                assert_eq!(validators.etag.as_deref(), Some("\"v1\""));
            }
            Fetched::NotModified => panic!("expected a key set"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn sends_etag_and_accepts_not_modified() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(keys_path()))
            .and(header("if-none-match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        let source = HttpKeySource::with_base_url(server.uri())?;
        let cached = CacheValidators {
            etag: Some("\"v1\"".into()),
            last_modified: None,
        };

        assert_eq!(source.fetch(&tenant(), Some(&cached)).await?, Fetched::NotModified);
        Ok(())
    }

    #[tokio::test]
    async fn server_error_is_a_status_failure() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let source = HttpKeySource::with_base_url(server.uri())?;
        let err = source.fetch(&tenant(), None).await.unwrap_err();

        assert!(matches!(err, FetchError::Status { status: 500 }));
        Ok(())
    }

    #[tokio::test]
    async fn non_key_set_body_is_a_body_failure() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>sign in</html>"))
            .mount(&server)
            .await;

        let source = HttpKeySource::with_base_url(server.uri())?;
        let err = source.fetch(&tenant(), None).await.unwrap_err();

        assert!(matches!(err, FetchError::Body(_)));
        Ok(())
    }

    #[tokio::test]
    async fn static_source_counts_and_fails_on_demand() -> Result<()> {
        let source = StaticKeySource::new(testing::key_set());
        source.fetch(&tenant(), None).await?;

        source.set_unavailable(true);
        assert!(source.fetch(&tenant(), None).await.is_err());
        assert_eq!(source.fetch_count(), 2);
        Ok(())
    }
}

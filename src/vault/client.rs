//! HTTP plumbing for the key vault REST API

use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::schema::ErrorDocument;
use crate::error::{RemoteError, RemoteErrorKind};

/// REST API version sent with every request.
pub const API_VERSION: &str = "7.4";

/// Builder struct for a [`VaultClient`].
#[derive(Debug)]
pub struct VaultClientBuilder {
    inner: reqwest::ClientBuilder,
    vault_url: Url,
    access_token: Option<String>,
}

impl VaultClientBuilder {
    pub(crate) fn new(vault_url: Url) -> Self {
        let builder = reqwest::Client::builder()
            .user_agent(concat!("vaultca / ", env!("CARGO_PKG_VERSION")));

        VaultClientBuilder {
            inner: builder,
            vault_url,
            access_token: None,
        }
    }

    /// Bearer token sent with every request.
    ///
    /// The token must be scoped to the key vault resource. Acquiring and
    /// refreshing it is left to the caller.
    pub fn access_token<S: Into<String>>(mut self, token: S) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Set a timeout on the underlying [`reqwest::Client`].
    pub fn timeout(mut self, timeout: std::time::Duration) -> Self {
        self.inner = self.inner.timeout(timeout);
        self
    }

    /// Set a connect timeout on the underlying [`reqwest::Client`].
    pub fn connect_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.inner = self.inner.connect_timeout(timeout);
        self
    }

    /// Finalize this and build this client. See [`reqwest::ClientBuilder::build`].
    pub fn build(self) -> Result<VaultClient, reqwest::Error> {
        Ok(VaultClient {
            inner: self.inner.build()?,
            vault_url: self.vault_url,
            access_token: self.access_token,
        })
    }
}

/// Authenticated HTTP client for one key vault.
#[derive(Debug, Clone)]
pub struct VaultClient {
    inner: reqwest::Client,
    vault_url: Url,
    access_token: Option<String>,
}

impl VaultClient {
    /// Create a new client builder for the vault at `vault_url`.
    pub fn builder(vault_url: Url) -> VaultClientBuilder {
        VaultClientBuilder::new(vault_url)
    }

    /// Base URL of the vault.
    pub fn vault_url(&self) -> &Url {
        &self.vault_url
    }

    /// Resolve a path such as `certificates/root-ca` against the vault URL.
    pub(super) fn url(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.vault_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                RemoteError::new(
                    RemoteErrorKind::Rejected,
                    format!("{} cannot be used as a base URL", self.vault_url),
                )
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Send a request, returning `None` if the resource does not exist.
    pub(super) async fn send<P, R>(
        &self,
        method: Method,
        mut url: Url,
        payload: Option<&P>,
    ) -> Result<Option<R>, RemoteError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if !url.query_pairs().any(|(key, _)| key == "api-version") {
            url.query_pairs_mut().append_pair("api-version", API_VERSION);
        }

        tracing::trace!(%method, %url, "REQ");
        let mut request = self.inner.request(method, url);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        if let Some(payload) = payload {
            request = request.json(payload);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            tracing::trace!(%status, "RES: not found");
            return Ok(None);
        }

        let body = response.bytes().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(process_error_response(status, &body));
        }

        tracing::trace!(%status, "RES: \n{}", String::from_utf8_lossy(&body));
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|err| RemoteError::protocol("decoding key vault response", err))
    }

    /// Send a request where a missing resource is an error.
    pub(super) async fn send_expecting<P, R>(
        &self,
        method: Method,
        url: Url,
        payload: Option<&P>,
    ) -> Result<R, RemoteError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let described = url.path().to_owned();
        self.send(method, url, payload).await?.ok_or_else(|| {
            RemoteError::new(RemoteErrorKind::NotFound, format!("{described} not found"))
        })
    }
}

/// Map an HTTP status to the failure it represents.
pub(crate) fn classify(status: StatusCode) -> RemoteErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteErrorKind::PermissionDenied,
        StatusCode::NOT_FOUND => RemoteErrorKind::NotFound,
        StatusCode::CONFLICT => RemoteErrorKind::Conflict,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            RemoteErrorKind::Unavailable
        }
        status if status.is_server_error() => RemoteErrorKind::Unavailable,
        status if status.is_client_error() => RemoteErrorKind::Rejected,
        _ => RemoteErrorKind::Protocol,
    }
}

fn transport_error(error: reqwest::Error) -> RemoteError {
    let kind = if error.is_decode() || error.is_body() {
        RemoteErrorKind::Protocol
    } else if error.is_builder() {
        RemoteErrorKind::Rejected
    } else {
        RemoteErrorKind::Unavailable
    };
    RemoteError::new(kind, "key vault request failed").with_source(error)
}

fn process_error_response(status: StatusCode, body: &[u8]) -> RemoteError {
    let kind = classify(status);
    let message = match serde_json::from_slice::<ErrorDocument>(body) {
        Ok(document) => {
            let code = document.error.code.unwrap_or_default();
            let message = document.error.message.unwrap_or_default();
            format!("{status} {code}: {message}")
        }
        Err(_) if body.is_empty() => status.to_string(),
        Err(_) => {
            tracing::trace!(%status, "RES: \n{}", String::from_utf8_lossy(body));
            format!("{status}: {}", String::from_utf8_lossy(body))
        }
    };
    tracing::debug!(%status, %kind, "Key vault request failed");
    RemoteError::new(kind, message)
}

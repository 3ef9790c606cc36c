//! REST binding of [`ItemSource`].

use async_trait::async_trait;
use mosaic_core::{ItemId, ItemSource, ListQuery, ListResponse, ListingError};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use tracing::{debug, warn};

use crate::config::{AuthConfig, ClientConfig};
use crate::error::ClientError;

/// Longest server message carried into an error.
const MAX_MESSAGE_LEN: usize = 200;

/// Which call a response belongs to; decides how 404 and 409 are read.
#[derive(Debug, Clone, Copy)]
enum Call<'a> {
    List,
    Mutation(Option<&'a ItemId>),
}

#[derive(Clone)]
pub struct RestItemSource {
    client: reqwest::Client,
    base_url: Url,
    auth_header: HeaderMap,
}

impl std::fmt::Debug for RestItemSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestItemSource")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl RestItemSource {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let base_url = Url::parse(&config.api_base_url).map_err(|err| {
            crate::config::ConfigError::InvalidValue {
                field: "api_base_url",
                reason: err.to_string(),
            }
        })?;
        Ok(Self {
            client,
            base_url,
            auth_header: build_auth_headers(&config.auth)?,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Base URL extended with escaped path segments.
    fn url(&self, segments: &[&str]) -> Result<Url, ListingError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ListingError::network(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn mutate(
        &self,
        method: Method,
        segments: &[&str],
        id: Option<&ItemId>,
    ) -> Result<(), ListingError> {
        let url = self.url(segments)?;
        debug!(method = %method, url = %url, "Sending mutation");
        let response = self
            .client
            .request(method, url)
            .headers(self.auth_header.clone())
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body, Call::Mutation(id)))
    }
}

#[async_trait]
impl ItemSource for RestItemSource {
    async fn list(&self, query: &ListQuery) -> Result<ListResponse, ListingError> {
        let url = self.url(&["api", "items"])?;
        let response = self
            .client
            .get(url)
            .headers(self.auth_header.clone())
            .query(query)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, &body, Call::List));
        }
        response.json::<ListResponse>().await.map_err(|err| {
            warn!(error = %err, "Undecodable list response");
            ListingError::server(status.as_u16(), format!("invalid list response: {err}"))
        })
    }

    async fn retry(&self, id: &ItemId) -> Result<(), ListingError> {
        self.mutate(Method::POST, &["api", "items", id.as_str(), "retry"], Some(id))
            .await
    }

    async fn archive(&self, id: &ItemId) -> Result<(), ListingError> {
        self.mutate(Method::POST, &["api", "items", id.as_str(), "archive"], Some(id))
            .await
    }

    async fn restore(&self, id: &ItemId) -> Result<(), ListingError> {
        self.mutate(Method::POST, &["api", "items", id.as_str(), "restore"], Some(id))
            .await
    }

    async fn delete(&self, id: &ItemId) -> Result<(), ListingError> {
        self.mutate(Method::DELETE, &["api", "items", id.as_str()], Some(id))
            .await
    }

    async fn delete_all(&self) -> Result<(), ListingError> {
        self.mutate(Method::DELETE, &["api", "items", "trash"], None)
            .await
    }
}

fn transport(err: reqwest::Error) -> ListingError {
    if err.is_timeout() {
        ListingError::network("request timed out")
    } else {
        ListingError::network(err.to_string())
    }
}

/// Map a non-success response onto the listing error taxonomy.
fn classify(status: StatusCode, body: &str, call: Call<'_>) -> ListingError {
    let message = server_message(body)
        .or_else(|| status.canonical_reason().map(str::to_string))
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
    match call {
        Call::Mutation(id)
            if status == StatusCode::NOT_FOUND || status == StatusCode::CONFLICT =>
        {
            ListingError::conflict(id.cloned(), message)
        }
        _ => ListingError::server(status.as_u16(), message),
    }
}

/// `message` or `error` from a JSON body, else the trimmed text.
fn server_message(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            ["message", "error"]
                .iter()
                .find_map(|field| value.get(field)?.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| body.to_string());
    Some(message.chars().take(MAX_MESSAGE_LEN).collect())
}

pub(crate) fn build_auth_headers(auth: &AuthConfig) -> Result<HeaderMap, ClientError> {
    let mut headers = HeaderMap::new();
    if let Some(api_key) = &auth.api_key {
        headers.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_str(api_key)
                .map_err(|_| ClientError::InvalidHeader { name: "x-api-key" })?,
        );
    }
    if let Some(jwt) = &auth.jwt {
        let value = format!("Bearer {}", jwt);
        headers.insert(
            HeaderName::from_static("authorization"),
            HeaderValue::from_str(&value)
                .map_err(|_| ClientError::InvalidHeader { name: "authorization" })?,
        );
    }
    Ok(headers)
}

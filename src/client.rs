//! HTTP client for the changes feed.
//!
//! One `GET {base}/{resource}?feed=changes&...` per call, decoded with a
//! caller-suppliable JSON decoder and classified into `FeedResult` so the
//! crawl loop can match on it exhaustively. The session cookie jar keeps
//! the server-set `SERVER_ID` cookie for sticky routing.

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;

use crate::config::ApiConfig;
use crate::offset::Direction;

/// Cookie used by upstream load balancers to pin a client to one backend.
pub const SERVER_ID_COOKIE_NAME: &str = "SERVER_ID";

/// Query parameters for one feed page request.
#[derive(Debug, Clone)]
pub struct FeedParams {
    pub descending: &'static str,
    pub offset: String,
    pub limit: u32,
    pub opt_fields: String,
    pub mode: String,
}

impl FeedParams {
    pub fn new(api: &ApiConfig, direction: Direction, offset: String) -> Self {
        Self {
            descending: direction.descending(),
            offset,
            limit: api.limit,
            opt_fields: api.opt_fields.join(","),
            mode: api.mode.clone(),
        }
    }
}

/// Raw wire shape of a feed page.
#[derive(Debug, Deserialize)]
pub struct FeedResponse {
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default)]
    pub next_page: Option<PageRef>,
    #[serde(default)]
    pub prev_page: Option<PageRef>,
}

#[derive(Debug, Deserialize)]
pub struct PageRef {
    #[serde(default)]
    pub offset: Value,
}

/// Decoder for feed page bodies. Swap it out when the upstream needs a
/// non-default JSON dialect.
pub type JsonDecoder = fn(&[u8]) -> serde_json::Result<FeedResponse>;

fn default_decoder(body: &[u8]) -> serde_json::Result<FeedResponse> {
    serde_json::from_slice(body)
}

/// One decoded feed page. Offsets are normalized to strings because the
/// server accepts them verbatim regardless of their JSON type.
#[derive(Debug)]
pub struct FeedPage {
    pub data: Vec<Value>,
    pub next_offset: String,
    pub prev_offset: String,
}

/// Classified outcome of one feed page request.
#[derive(Debug)]
pub enum FeedResult {
    Page(FeedPage),
    /// Transport failure or undecodable body.
    TransientNet(String),
    /// HTTP 429.
    TooManyRequests,
    /// HTTP 412. Retry the same request unchanged.
    PreconditionFailed,
    /// HTTP 404. The cursor expired or never existed.
    OffsetInvalid,
    /// Any other non-2xx status.
    UnexpectedStatus(u16, String),
}

/// HTTP session shared by both crawl directions and the resource fetcher.
pub struct FeedClient {
    http: reqwest::Client,
    jar: Arc<Jar>,
    host_url: Url,
    feed_url: String,
    decoder: JsonDecoder,
}

impl FeedClient {
    pub fn new(
        api: &ApiConfig,
        resource: &str,
        additional_headers: Option<HeaderMap>,
        decoder: Option<JsonDecoder>,
    ) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&api.user_agent).context("invalid user agent header value")?,
        );
        if let Some(ref token) = api.token {
            default_headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))
                    .context("invalid token header value")?,
            );
        }
        if let Some(extra) = additional_headers {
            default_headers.extend(extra);
        }

        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .cookie_provider(jar.clone())
            // the session is pinned to one backend; keep its connection
            .pool_idle_timeout(None)
            .build()
            .context("building HTTP client")?;

        let host_url = Url::parse(&api.host).context("parsing API host")?;

        Ok(Self {
            http,
            jar,
            host_url,
            feed_url: api.resource_url(resource),
            decoder: decoder.unwrap_or(default_decoder),
        })
    }

    /// The feed endpoint this client polls (for logging).
    pub fn feed_url(&self) -> &str {
        &self.feed_url
    }

    /// Raw HTTP session, for single-resource fetches.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Fetch and classify one feed page. Never returns an `Err`; every
    /// outcome maps to a `FeedResult` variant.
    pub async fn get_feed(&self, params: &FeedParams) -> FeedResult {
        let limit = params.limit.to_string();
        let query = [
            ("feed", "changes"),
            ("descending", params.descending),
            ("offset", params.offset.as_str()),
            ("limit", limit.as_str()),
            ("opt_fields", params.opt_fields.as_str()),
            ("mode", params.mode.as_str()),
        ];

        let response = match self.http.get(&self.feed_url).query(&query).send().await {
            Ok(r) => r,
            Err(e) => return FeedResult::TransientNet(e.to_string()),
        };

        match response.status().as_u16() {
            200..=299 => {
                let body = match response.bytes().await {
                    Ok(b) => b,
                    Err(e) => return FeedResult::TransientNet(e.to_string()),
                };
                match (self.decoder)(&body) {
                    Ok(decoded) => FeedResult::Page(FeedPage::from(decoded)),
                    Err(e) => FeedResult::TransientNet(e.to_string()),
                }
            }
            429 => FeedResult::TooManyRequests,
            412 => FeedResult::PreconditionFailed,
            404 => FeedResult::OffsetInvalid,
            status => {
                let body = response.text().await.unwrap_or_default();
                FeedResult::UnexpectedStatus(status, truncate(&body, 200))
            }
        }
    }

    /// Current value of the sticky routing cookie, if the server set one.
    pub fn server_id(&self) -> Option<String> {
        let header = self.jar.cookies(&self.host_url)?;
        let cookies = header.to_str().ok()?;
        cookies.split(';').map(str::trim).find_map(|pair| {
            pair.strip_prefix(SERVER_ID_COOKIE_NAME)?
                .strip_prefix('=')
                .map(str::to_string)
        })
    }

    /// Plant a previously persisted sticky cookie into the jar.
    pub fn set_server_id(&self, value: &str) {
        self.jar.add_cookie_str(
            &format!("{}={}", SERVER_ID_COOKIE_NAME, value),
            &self.host_url,
        );
    }
}

impl From<FeedResponse> for FeedPage {
    fn from(raw: FeedResponse) -> Self {
        Self {
            next_offset: page_offset(raw.next_page.as_ref()),
            prev_offset: page_offset(raw.prev_page.as_ref()),
            data: raw.data,
        }
    }
}

/// Normalize a page offset to its string rendering; absent pages map to "".
fn page_offset(page: Option<&PageRef>) -> String {
    match page.map(|p| &p.offset) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn truncate(body: &str, max_chars: usize) -> String {
    body.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn test_api(server: &MockServer) -> ApiConfig {
        ApiConfig {
            host: server.base_url(),
            version: "2.5".to_string(),
            limit: 100,
            mode: "_all_".to_string(),
            opt_fields: vec!["status".to_string(), "dateModified".to_string()],
            token: None,
            user_agent: "test-crawler".to_string(),
            resource: "tenders".to_string(),
        }
    }

    fn test_client(server: &MockServer) -> FeedClient {
        FeedClient::new(&test_api(server), "tenders", None, None).unwrap()
    }

    fn params(offset: &str) -> FeedParams {
        FeedParams {
            descending: "",
            offset: offset.to_string(),
            limit: 100,
            opt_fields: "status,dateModified".to_string(),
            mode: "_all_".to_string(),
        }
    }

    #[tokio::test]
    async fn test_page_decodes_data_and_offsets() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/2.5/tenders")
                    .query_param("feed", "changes")
                    .query_param("offset", "abc")
                    .query_param("limit", "100")
                    .query_param("mode", "_all_");
                then.status(200).json_body(json!({
                    "data": [{"id": "1"}, {"id": "2"}],
                    "next_page": {"offset": "n1"},
                    "prev_page": {"offset": "p1"},
                }));
            })
            .await;

        let client = test_client(&server);
        let result = client.get_feed(&params("abc")).await;
        mock.assert_async().await;

        match result {
            FeedResult::Page(page) => {
                assert_eq!(page.data.len(), 2);
                assert_eq!(page.next_offset, "n1");
                assert_eq!(page.prev_offset, "p1");
            }
            other => panic!("expected Page, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_numeric_offsets_are_normalized() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/2.5/tenders");
                then.status(200).json_body(json!({
                    "data": [],
                    "next_page": {"offset": 1731103209.5},
                }));
            })
            .await;

        let client = test_client(&server);
        match client.get_feed(&params("")).await {
            FeedResult::Page(page) => {
                assert_eq!(page.next_offset, "1731103209.5");
                // absent prev_page maps to ""
                assert_eq!(page.prev_offset, "");
            }
            other => panic!("expected Page, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start_async().await;
        for (status, check) in [
            (429u16, FeedResult::TooManyRequests),
            (412u16, FeedResult::PreconditionFailed),
            (404u16, FeedResult::OffsetInvalid),
        ] {
            server
                .mock_async(|when, then| {
                    when.method(GET)
                        .path("/api/2.5/tenders")
                        .query_param("offset", status.to_string());
                    then.status(status);
                })
                .await;

            let client = test_client(&server);
            let result = client.get_feed(&params(&status.to_string())).await;
            assert_eq!(
                std::mem::discriminant(&result),
                std::mem::discriminant(&check),
                "status {} classified as {:?}",
                status,
                result
            );
        }
    }

    #[tokio::test]
    async fn test_unexpected_status_carries_code_and_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/2.5/tenders");
                then.status(502).body("bad gateway");
            })
            .await;

        let client = test_client(&server);
        match client.get_feed(&params("x")).await {
            FeedResult::UnexpectedStatus(code, body) => {
                assert_eq!(code, 502);
                assert_eq!(body, "bad gateway");
            }
            other => panic!("expected UnexpectedStatus, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_undecodable_body_is_transient() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/2.5/tenders");
                then.status(200).body("{not json");
            })
            .await;

        let client = test_client(&server);
        assert!(matches!(
            client.get_feed(&params("x")).await,
            FeedResult::TransientNet(_)
        ));
    }

    #[tokio::test]
    async fn test_default_headers_sent() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/2.5/tenders")
                    .header("user-agent", "test-crawler")
                    .header("authorization", "Bearer sekrit");
                then.status(200).json_body(json!({"data": []}));
            })
            .await;

        let mut api = test_api(&server);
        api.token = Some("sekrit".to_string());
        let client = FeedClient::new(&api, "tenders", None, None).unwrap();
        client.get_feed(&params("")).await;
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_set_cookie_sticks_and_is_readable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/2.5/tenders")
                    .query_param("offset", "first");
                then.status(200)
                    .header("set-cookie", "SERVER_ID=abc123; Path=/")
                    .json_body(json!({"data": []}));
            })
            .await;
        let followup = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/2.5/tenders")
                    .query_param("offset", "second")
                    .header("cookie", "SERVER_ID=abc123");
                then.status(200).json_body(json!({"data": []}));
            })
            .await;

        let client = test_client(&server);
        client.get_feed(&params("first")).await;
        assert_eq!(client.server_id(), Some("abc123".to_string()));

        client.get_feed(&params("second")).await;
        followup.assert_async().await;
    }

    #[tokio::test]
    async fn test_planted_server_id_round_trips() {
        let server = MockServer::start_async().await;
        let client = test_client(&server);

        assert_eq!(client.server_id(), None);
        client.set_server_id("007");
        assert_eq!(client.server_id(), Some("007".to_string()));
    }
}

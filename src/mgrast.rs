use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::domain::Query;
use crate::error::CollectorError;

pub const DEFAULT_SEARCH_URL: &str = "https://api.mg-rast.org/search";
pub const DEFAULT_METAGENOME_URL: &str = "https://api-ui.mg-rast.org/metagenome";

/// One page of search results as returned by the search endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawPage {
    pub data: Vec<Value>,
    #[serde(default)]
    pub next: Option<String>,
}

impl RawPage {
    pub fn from_json(text: &str) -> Result<Self, CollectorError> {
        serde_json::from_str(text).map_err(|err| CollectorError::MalformedPage(err.to_string()))
    }

    /// Continuation URL, if the service announced another page.
    pub fn next_url(&self) -> Option<&str> {
        self.next
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

pub trait MgRastClient: Send + Sync {
    fn search(&self, query: &Query) -> Result<RawPage, CollectorError>;
    fn follow(&self, next_url: &str) -> Result<RawPage, CollectorError>;
    /// Raw `[[reads, species], ...]` rarefaction samples for one metagenome.
    fn rarefaction(&self, metagenome_id: &str) -> Result<Value, CollectorError>;
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub search_url: String,
    pub metagenome_url: String,
    pub timeout: Duration,
    pub page_size: usize,
    pub max_retries: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            search_url: DEFAULT_SEARCH_URL.to_string(),
            metagenome_url: DEFAULT_METAGENOME_URL.to_string(),
            timeout: Duration::from_secs(60),
            page_size: 5,
            max_retries: 0,
        }
    }
}

/// Query-string parameters of the first search request for `query`.
pub fn search_params(query: &Query, page_size: usize) -> Vec<(String, String)> {
    let mut params = vec![
        ("limit".to_string(), page_size.to_string()),
        ("order".to_string(), query.order_field().to_string()),
        ("direction".to_string(), query.direction().as_str().to_string()),
        (
            "public".to_string(),
            if query.public_data() { "yes" } else { "no" }.to_string(),
        ),
    ];
    for filter in query.filters() {
        params.push((filter.field.clone(), filter.value.clone()));
    }
    params
}

#[derive(Clone)]
pub struct MgRastHttpClient {
    client: Client,
    settings: ClientSettings,
}

impl MgRastHttpClient {
    pub fn new(settings: ClientSettings) -> Result<Self, CollectorError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!(
                "metagenome-collector/{}",
                env!("CARGO_PKG_VERSION")
            ))
            .map_err(|err| CollectorError::SearchHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout)
            .build()
            .map_err(|err| CollectorError::SearchHttp(err.to_string()))?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    fn fetch_page<F>(&self, make_req: F) -> Result<RawPage, CollectorError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        let response = self.send_with_retries(make_req, CollectorError::SearchHttp)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "search request failed".to_string());
            return Err(CollectorError::SearchStatus { status, message });
        }
        let body = response
            .text()
            .map_err(|err| CollectorError::SearchHttp(err.to_string()))?;
        RawPage::from_json(&body)
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
        transport_error: fn(String) -> CollectorError,
    ) -> Result<reqwest::blocking::Response, CollectorError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const BASE_DELAY_MS: u64 = 200;
        let max_retries = self.settings.max_retries;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < max_retries && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!(status, attempt, "retrying request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < max_retries && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        debug!(error = %err, attempt, "retrying request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(transport_error(err.to_string()));
                }
            }
        }
    }
}

impl MgRastClient for MgRastHttpClient {
    fn search(&self, query: &Query) -> Result<RawPage, CollectorError> {
        let params = search_params(query, self.settings.page_size);
        debug!(url = %self.settings.search_url, query = query.sequence(), "search request");
        self.fetch_page(|| self.client.get(&self.settings.search_url).query(&params))
    }

    fn follow(&self, next_url: &str) -> Result<RawPage, CollectorError> {
        debug!(url = %next_url, "continuation request");
        self.fetch_page(|| self.client.get(next_url))
    }

    fn rarefaction(&self, metagenome_id: &str) -> Result<Value, CollectorError> {
        let url = format!(
            "{}/{}",
            self.settings.metagenome_url.trim_end_matches('/'),
            metagenome_id
        );
        let response = self.send_with_retries(
            || {
                self.client
                    .get(&url)
                    .query(&[("verbosity", "stats"), ("detail", "rarefaction")])
            },
            CollectorError::RarefactionHttp,
        )?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "rarefaction request failed".to_string());
            return Err(CollectorError::RarefactionStatus { status, message });
        }
        let body = response
            .text()
            .map_err(|err| CollectorError::RarefactionHttp(err.to_string()))?;
        serde_json::from_str(&body).map_err(|err| CollectorError::MalformedCurve(err.to_string()))
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{KeywordTag, SortDirection};

    #[test]
    fn search_params_carry_scope_and_filters() {
        let keyword = KeywordTag::from_tokens(&["biome", "soil", "country", "USA"]).unwrap();
        let query = Query::new(1, keyword, 10)
            .unwrap()
            .with_direction(SortDirection::Desc)
            .with_public_data(true);
        let params = search_params(&query, 5);
        let as_str = params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            as_str,
            vec![
                ("limit", "5"),
                ("order", "created_on"),
                ("direction", "desc"),
                ("public", "yes"),
                ("biome", "soil"),
                ("country", "USA"),
            ]
        );
    }

    #[test]
    fn empty_next_means_last_page() {
        let page = RawPage::from_json(r#"{"data": [], "next": ""}"#).unwrap();
        assert_eq!(page.next_url(), None);
        let page = RawPage::from_json(r#"{"data": [], "next": null}"#).unwrap();
        assert_eq!(page.next_url(), None);
    }

    #[test]
    fn only_connect_and_timeout_errors_are_retried() {
        let client = Client::new();
        let refused = client.get("http://127.0.0.1:1/search").send().unwrap_err();
        assert!(is_retryable_error(&refused));
        let unparsable = client.get("not a url").send().unwrap_err();
        assert!(!is_retryable_error(&unparsable));
    }

    #[test]
    fn refused_search_surfaces_as_transport_error() {
        let client = MgRastHttpClient::new(ClientSettings {
            search_url: "http://127.0.0.1:1/search".to_string(),
            max_retries: 1,
            ..ClientSettings::default()
        })
        .unwrap();
        let keyword = KeywordTag::from_tokens(&["biome", "soil"]).unwrap();
        let query = Query::new(1, keyword, 1).unwrap();
        let err = client.search(&query).unwrap_err();
        assert!(matches!(err, CollectorError::SearchHttp(_)));
    }

    #[test]
    fn page_without_data_is_malformed() {
        let err = RawPage::from_json(r#"{"error": "bad"}"#).unwrap_err();
        assert!(err.is_transport());
    }
}

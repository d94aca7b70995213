//! Generic REST client (spec.md §4.1 / C1).
//!
//! Grounded on `original_source/internal/rest-client/rest_client.go`'s
//! `doRequest`/`DoWithRetry`, restyled on `reqwest::Client` construction as
//! seen in `indexmaker-backend/src/services/exchange_api.rs`.
//!
//! Decoding is narrowed to the JSON subset this crate actually uses (see
//! SPEC_FULL.md §10.4): the original's content-type branching (textual and
//! unknown bodies routed to a string/byte destination) has no call site here
//! — the only caller is the depth snapshot fetch, which is always JSON.

use crate::error::{AppError, AppResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct RequestOptions<B: Serialize = ()> {
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Option<B>,
}

pub struct RestClient {
    base_url: String,
    client: reqwest::Client,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client builds with a plain timeout"),
        }
    }

    async fn do_request<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        opts: RequestOptions<B>,
    ) -> AppResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .request(method, &url)
            .header("Content-Type", "application/json")
            .query(&opts.query.into_iter().collect::<Vec<_>>());

        for (k, v) in opts.headers {
            req = req.header(k, v);
        }
        if let Some(body) = opts.body {
            req = req.json(&body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;

        if !status.is_success() {
            return Err(AppError::HttpStatus {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).to_string(),
            });
        }

        serde_json::from_slice(&bytes)
            .map_err(|e| AppError::Decode(format!("decoding {url}: {e}")))
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        opts: RequestOptions<()>,
    ) -> AppResult<T> {
        self.do_request(reqwest::Method::GET, path, opts).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        opts: RequestOptions<B>,
    ) -> AppResult<T> {
        self.do_request(reqwest::Method::POST, path, opts).await
    }

    pub async fn put<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        opts: RequestOptions<B>,
    ) -> AppResult<T> {
        self.do_request(reqwest::Method::PUT, path, opts).await
    }

    pub async fn patch<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        opts: RequestOptions<B>,
    ) -> AppResult<T> {
        self.do_request(reqwest::Method::PATCH, path, opts).await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
        opts: RequestOptions<()>,
    ) -> AppResult<T> {
        self.do_request(reqwest::Method::DELETE, path, opts).await
    }

    /// Replays the request body (held in memory) on a configurable set of
    /// retry-eligible status codes, with a linear `1s * attempt` back-off.
    pub async fn get_with_retry<T: DeserializeOwned>(
        &self,
        path: &str,
        opts: RequestOptions<()>,
        retry: u32,
        retry_status_codes: &[u16],
    ) -> AppResult<T> {
        let mut attempt = 0;
        loop {
            match self
                .get::<T>(path, RequestOptions {
                    headers: opts.headers.clone(),
                    query: opts.query.clone(),
                    body: None,
                })
                .await
            {
                Ok(v) => return Ok(v),
                Err(AppError::HttpStatus { status, body }) => {
                    if attempt >= retry || !retry_status_codes.contains(&status) {
                        return Err(AppError::HttpStatus { status, body });
                    }
                    attempt += 1;
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_options_default_is_empty() {
        let opts: RequestOptions<()> = RequestOptions::default();
        assert!(opts.headers.is_empty());
        assert!(opts.query.is_empty());
        assert!(opts.body.is_none());
    }
}

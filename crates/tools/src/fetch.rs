//! Ordered CORS-relay fallback chain used for page fetches and searches.
//!
//! Each target is requested through the configured relays one at a time.
//! The first attempt that succeeds at the transport level *and* yields
//! acceptable content wins; everything else (timeout, non-2xx, empty body,
//! too little content) moves on to the next relay.  No relay is retried and
//! exhausting the chain is not an error: the report simply has no result.

use std::fmt;

use anyhow::Result;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use tracing::{debug, info, warn};

use fireflies_config::FetchConfig;

use crate::html::{self, SearchHit};

/// Characters left unescaped by JavaScript's `encodeURIComponent`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, URI_COMPONENT).to_string()
}

/// What happened on one relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Accepted,
    Timeout,
    Status(u16),
    Transport,
    Empty,
    Insufficient,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::Timeout => write!(f, "timed out"),
            Self::Status(code) => write!(f, "HTTP {code}"),
            Self::Transport => write!(f, "transport error"),
            Self::Empty => write!(f, "empty body"),
            Self::Insufficient => write!(f, "insufficient content"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAttempt {
    pub proxy: String,
    pub outcome: AttemptOutcome,
}

/// Result of walking the chain plus the per-relay trail.
#[derive(Debug, Clone)]
pub struct ChainReport<T> {
    pub result: Option<T>,
    pub attempts: Vec<ProxyAttempt>,
}

impl<T> ChainReport<T> {
    /// One-line summary of the failed attempts, for error messages.
    pub fn failure_summary(&self) -> String {
        if self.attempts.is_empty() {
            return "no proxies configured".to_string();
        }
        self.attempts
            .iter()
            .map(|a| format!("{}: {}", a.proxy, a.outcome))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchedPage {
    pub url: String,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct FetchChain {
    client: reqwest::Client,
    config: FetchConfig,
}

impl FetchChain {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Relay URL for `target` through `proxy`.
    pub fn proxied_url(proxy: &str, target: &str) -> String {
        format!("{proxy}{}", encode_component(target))
    }

    /// DuckDuckGo HTML results URL for `query`.
    pub fn search_url(&self, query: &str) -> String {
        format!("{}{}", self.config.search_endpoint, encode_component(query))
    }

    /// Fetch a page as text capped at `page_char_cap` characters.
    pub async fn fetch_page(&self, url: &str) -> ChainReport<FetchedPage> {
        let cap = self.config.page_char_cap;
        let min = self.config.min_content_length;
        self.walk(url, |body| {
            let content = html::html_to_text(body, cap);
            (content.chars().count() >= min).then(|| FetchedPage {
                url: url.to_string(),
                title: html::page_title(body),
                content,
            })
        })
        .await
    }

    /// Fetch a short excerpt of a page (`excerpt_char_cap` characters).
    pub async fn fetch_excerpt(&self, url: &str) -> ChainReport<String> {
        let cap = self.config.excerpt_char_cap;
        let min = self.config.min_content_length;
        self.walk(url, |body| {
            let content = html::html_to_text(body, cap);
            (content.chars().count() >= min).then_some(content)
        })
        .await
    }

    /// Run a search; accepted once at least one result parses.
    pub async fn search(&self, query: &str, max_results: usize) -> ChainReport<Vec<SearchHit>> {
        let target = self.search_url(query);
        self.walk(&target, |body| {
            let hits = html::parse_search_results(body, max_results);
            (!hits.is_empty()).then_some(hits)
        })
        .await
    }

    async fn walk<T, F>(&self, target: &str, accept: F) -> ChainReport<T>
    where
        F: Fn(&str) -> Option<T>,
    {
        let mut attempts = Vec::with_capacity(self.config.proxy_order.len());

        for proxy in &self.config.proxy_order {
            let outcome = match self.attempt(proxy, target).await {
                Ok(body) => match accept(&body) {
                    Some(value) => {
                        info!(proxy = %proxy, url = target, "fetch chain accepted response");
                        attempts.push(ProxyAttempt {
                            proxy: proxy.clone(),
                            outcome: AttemptOutcome::Accepted,
                        });
                        return ChainReport {
                            result: Some(value),
                            attempts,
                        };
                    }
                    None => AttemptOutcome::Insufficient,
                },
                Err(outcome) => outcome,
            };
            debug!(proxy = %proxy, url = target, %outcome, "proxy attempt failed");
            attempts.push(ProxyAttempt {
                proxy: proxy.clone(),
                outcome,
            });
        }

        warn!(url = target, tried = attempts.len(), "fetch chain exhausted");
        ChainReport {
            result: None,
            attempts,
        }
    }

    async fn attempt(&self, proxy: &str, target: &str) -> Result<String, AttemptOutcome> {
        let url = Self::proxied_url(proxy, target);
        match tokio::time::timeout(self.config.timeout(), self.request(&url)).await {
            Err(_) => Err(AttemptOutcome::Timeout),
            Ok(Err(err)) if err.is_timeout() => Err(AttemptOutcome::Timeout),
            Ok(Err(_)) => Err(AttemptOutcome::Transport),
            Ok(Ok((status, None))) => Err(AttemptOutcome::Status(status)),
            Ok(Ok((_, Some(body)))) if body.trim().is_empty() => Err(AttemptOutcome::Empty),
            Ok(Ok((_, Some(body)))) => Ok(body),
        }
    }

    /// Status plus body; the body is only read for 2xx responses.
    async fn request(&self, url: &str) -> reqwest::Result<(u16, Option<String>)> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/html,application/xhtml+xml,*/*")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Ok((status.as_u16(), None));
        }
        Ok((status.as_u16(), Some(response.text().await?)))
    }
}

/// Search-engine links offered when no relay produced results.
pub fn fallback_results(query: &str) -> Vec<SearchHit> {
    let encoded = encode_component(query);
    let wiki_title = encode_component(&query.split_whitespace().collect::<Vec<_>>().join("_"));
    vec![
        SearchHit {
            title: format!("{query} - Wikipedia Indonesia"),
            url: format!("https://id.wikipedia.org/wiki/{wiki_title}"),
            snippet: format!("Encyclopedia article about {query}."),
        },
        SearchHit {
            title: format!("{query} - Google Search"),
            url: format!("https://www.google.com/search?q={encoded}"),
            snippet: format!("Current search results for {query}."),
        },
        SearchHit {
            title: format!("{query} - DuckDuckGo"),
            url: format!("https://duckduckgo.com/?q={encoded}"),
            snippet: format!("Information about {query} from across the web."),
        },
        SearchHit {
            title: format!("{query} - Bing Search"),
            url: format!("https://www.bing.com/search?q={encoded}"),
            snippet: format!("Latest information about {query} from Bing."),
        },
    ]
}

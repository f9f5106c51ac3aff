//! HTTP expansion collaborator: fetches a page and extracts its links.
//!
//! This is the concrete `FetchFn` the demo binary plugs into the dispatcher;
//! the dispatcher core itself never touches the network.

use crate::canonical::canonical_url;
use crate::dispatch::{DynError, FetchFn};
use futures_util::FutureExt;
use lol_html::{element, HtmlRewriter, OutputSink, Settings};
use reqwest::Client;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use url::Url;

const USER_AGENT: &str = "fanout-crawl/0.1";
const REDIRECT_LIMIT: usize = 5;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches pages over HTTP and expands them into same-site links.
pub struct WebFetcher {
    client: Client,
    allowed_domains: Vec<String>,
    max_links_per_page: usize,
    politeness_delay: Duration,
}

impl WebFetcher {
    /// Builds a fetcher with its own HTTP client.
    ///
    /// An empty `allowed_domains` list admits every domain.
    pub fn new(
        allowed_domains: Vec<String>,
        max_links_per_page: usize,
        politeness_delay: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(REDIRECT_LIMIT))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            allowed_domains,
            max_links_per_page,
            politeness_delay,
        })
    }

    /// Determines whether the provided domain passes the allowlist.
    pub fn is_domain_allowed(&self, domain: &str) -> bool {
        self.allowed_domains.is_empty()
            || self.allowed_domains.iter().any(|allowed| allowed == domain)
    }

    /// Fetches one page and returns the allowlisted links it contains.
    ///
    /// Non-success statuses expand to no children rather than an error; the
    /// page was reachable, it just has nothing to follow.
    pub async fn expand(&self, page: Url) -> Result<Vec<Url>, DynError> {
        if !self.politeness_delay.is_zero() {
            sleep(self.politeness_delay).await;
        }

        let response = self.client.get(page.clone()).send().await?;
        if !response.status().is_success() {
            return Ok(Vec::new());
        }

        let body = response.bytes().await?;
        let links = extract_links(&body, &page, self.max_links_per_page)?;
        Ok(links
            .into_iter()
            .filter(|link| {
                link.domain()
                    .map(|domain| self.is_domain_allowed(domain))
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Wraps the fetcher into the callback shape the dispatcher consumes.
    pub fn fetch_fn(self) -> FetchFn<Url> {
        let fetcher = Arc::new(self);
        Arc::new(move |page: Url| {
            let fetcher = Arc::clone(&fetcher);
            async move { fetcher.expand(page).await }.boxed()
        })
    }
}

/// Collects canonicalized anchor targets from a buffered HTML body.
///
/// Runs a single `lol_html` pass; hrefs are resolved against `page` and
/// canonicalized, and only the first `limit` accepted links are kept.
fn extract_links(body: &[u8], page: &Url, limit: usize) -> Result<Vec<Url>, LinkExtractError> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    let mut found: Vec<Url> = Vec::new();
    {
        let handler = element!("a[href]", |el| {
            if found.len() >= limit {
                return Ok(());
            }
            if let Some(href) = el.get_attribute("href") {
                if let Some(link) = page.join(&href).ok().as_ref().and_then(canonical_url) {
                    found.push(link);
                }
            }
            Ok(())
        });

        let mut rewriter = HtmlRewriter::new(
            Settings {
                element_content_handlers: vec![handler],
                ..Settings::default()
            },
            DiscardSink,
        );
        rewriter.write(body).map_err(LinkExtractError::Rewrite)?;
        rewriter.end().map_err(LinkExtractError::Rewrite)?;
    }

    Ok(found)
}

/// Errors surfaced while scanning a page body for links.
#[derive(Debug)]
pub enum LinkExtractError {
    /// The HTML rewriter encountered markup it could not process.
    Rewrite(lol_html::errors::RewritingError),
}

impl fmt::Display for LinkExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rewrite(err) => write!(f, "html rewrite error: {err}"),
        }
    }
}

impl Error for LinkExtractError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Rewrite(err) => Some(err),
        }
    }
}

struct DiscardSink;

impl OutputSink for DiscardSink {
    fn handle_chunk(&mut self, _chunk: &[u8]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = "https://site.test/docs/index.html";

    fn links_of(html: &str, limit: usize) -> Vec<String> {
        let page = Url::parse(PAGE).unwrap();
        extract_links(html.as_bytes(), &page, limit)
            .unwrap()
            .into_iter()
            .map(|u| u.to_string())
            .collect()
    }

    #[test]
    fn relative_links_resolve_against_the_page() {
        let html = r#"<a href="guide.html">guide</a><a href="/about">about</a>"#;
        assert_eq!(
            links_of(html, 16),
            vec![
                "https://site.test/docs/guide.html".to_string(),
                "https://site.test/about".to_string(),
            ]
        );
    }

    #[test]
    fn fragments_and_non_http_targets_dropped() {
        let html = r#"
            <a href="page.html#section">frag</a>
            <a href="mailto:x@site.test">mail</a>
            <a href="javascript:void(0)">js</a>
        "#;
        assert_eq!(
            links_of(html, 16),
            vec!["https://site.test/docs/page.html".to_string()]
        );
    }

    #[test]
    fn link_cap_is_enforced() {
        let html = r#"<a href="/a">a</a><a href="/b">b</a><a href="/c">c</a>"#;
        assert_eq!(links_of(html, 2).len(), 2);
        assert!(links_of(html, 0).is_empty());
    }

    #[test]
    fn empty_allowlist_admits_any_domain() {
        let fetcher = WebFetcher::new(Vec::new(), 16, Duration::ZERO).unwrap();
        assert!(fetcher.is_domain_allowed("anything.test"));

        let scoped =
            WebFetcher::new(vec!["site.test".to_string()], 16, Duration::ZERO).unwrap();
        assert!(scoped.is_domain_allowed("site.test"));
        assert!(!scoped.is_domain_allowed("other.test"));
    }
}

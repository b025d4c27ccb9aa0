//! HTTP adapters: a `reqwest::Client` per source and an index-page discoverer.
//!
//! Discovery fetches the source's configured index page and collects links
//! matching its CSS selector. Relative links are resolved against the index
//! URL; only `http(s)` links on the same host are kept.

use super::{DiscoveredArticle, DiscoveryError, Discoverer, ResourceError, ResourceFactory};
use crate::config::{OrchestratorConfig, SourceConfig};
use async_trait::async_trait;
use itertools::Itertools;
use reqwest::Client;
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};
use url::Url;

/// Builds one HTTP client per source.
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    user_agent: String,
    timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(user_agent: impl Into<String>, timeout: Duration) -> Self {
        Self {
            user_agent: user_agent.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ResourceFactory<Client> for HttpClientFactory {
    async fn create(&self, source: &str) -> Result<Client, ResourceError> {
        Client::builder()
            .user_agent(&self.user_agent)
            .timeout(self.timeout)
            .build()
            .map_err(|e| ResourceError::Create {
                source_id: source.to_string(),
                reason: e.to_string(),
            })
    }

    async fn close(&self, source: &str, _resource: Arc<Client>) -> Result<(), ResourceError> {
        // Connections are released once the last clone of the client drops.
        debug!(source, "Released HTTP client");
        Ok(())
    }
}

/// Discovers article links from each source's index page.
#[derive(Debug, Clone)]
pub struct IndexPageDiscoverer {
    sources: HashMap<String, SourceConfig>,
}

impl IndexPageDiscoverer {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            sources: config
                .sources
                .iter()
                .map(|s| (s.name.clone(), s.clone()))
                .collect(),
        }
    }

    /// Index URL for a source: the configured one, else `https://<name>/`.
    fn index_url(source: &SourceConfig) -> String {
        source
            .index_url
            .clone()
            .unwrap_or_else(|| format!("https://{}/", source.name))
    }
}

#[async_trait]
impl Discoverer<Client> for IndexPageDiscoverer {
    #[instrument(level = "info", skip(self, client))]
    async fn discover(
        &self,
        source: &str,
        client: &Client,
    ) -> Result<Vec<DiscoveredArticle>, DiscoveryError> {
        let config = self
            .sources
            .get(source)
            .cloned()
            .unwrap_or_else(|| SourceConfig::named(source, 1.0));
        let index_url = Self::index_url(&config);

        let response = client.get(&index_url).send().await.map_err(|e| {
            if e.is_timeout() {
                DiscoveryError::Timeout(e.to_string())
            } else {
                DiscoveryError::Network(e.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::Network(format!(
                "HTTP {} from {}",
                status, index_url
            )));
        }
        let html = response
            .text()
            .await
            .map_err(|e| DiscoveryError::Network(e.to_string()))?;

        let mut urls = extract_links(&html, &index_url, &config.link_selector)?;
        urls.truncate(config.discovery_limit);
        info!(count = urls.len(), %index_url, "Indexed article URLs");
        debug!(urls = ?urls, "Discovered URLs");

        Ok(urls.into_iter().map(DiscoveredArticle::new).collect())
    }
}

/// Collect unique same-host article links from an index page.
pub fn extract_links(
    html: &str,
    base_url: &str,
    selector: &str,
) -> Result<Vec<String>, DiscoveryError> {
    let base = Url::parse(base_url)
        .map_err(|e| DiscoveryError::Parse(format!("bad index url {base_url}: {e}")))?;
    let selector = Selector::parse(selector)
        .map_err(|e| DiscoveryError::Parse(format!("bad selector {selector}: {e}")))?;
    let document = Html::parse_document(html);

    let links = document
        .select(&selector)
        .filter_map(|element| element.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .filter(|url| url.host_str() == base.host_str())
        .map(|mut url| {
            url.set_fragment(None);
            url
        })
        .filter(|url| url.path() != base.path())
        .map(|url| url.to_string())
        .unique()
        .collect();
    Ok(links)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r##"
        <html><body>
          <a href="/news/open-championship-recap">Recap</a>
          <a href="/news/open-championship-recap#comments">Recap comments</a>
          <a href="https://golf.com/equipment/new-driver">Driver</a>
          <a href="https://ads.example.com/promo">Ad</a>
          <a href="mailto:tips@golf.com">Mail</a>
          <a href="/news/">News index</a>
          <div class="card"><a href="instruction/putting">Putting</a></div>
        </body></html>
    "##;

    #[test]
    fn test_extract_links_resolves_and_filters() {
        let links = extract_links(INDEX, "https://golf.com/news/", "a[href]").unwrap();
        assert_eq!(
            links,
            vec![
                "https://golf.com/news/open-championship-recap",
                "https://golf.com/equipment/new-driver",
                "https://golf.com/news/instruction/putting",
            ]
        );
    }

    #[test]
    fn test_extract_links_respects_selector() {
        let links = extract_links(INDEX, "https://golf.com/news/", ".card a[href]").unwrap();
        assert_eq!(links, vec!["https://golf.com/news/instruction/putting"]);
    }

    #[test]
    fn test_extract_links_rejects_bad_selector() {
        let err = extract_links(INDEX, "https://golf.com/", "a[[").unwrap_err();
        assert!(matches!(err, DiscoveryError::Parse(_)));
    }

    #[test]
    fn test_default_index_url() {
        let source = SourceConfig::named("golf.com", 1.3);
        assert_eq!(IndexPageDiscoverer::index_url(&source), "https://golf.com/");
    }
}

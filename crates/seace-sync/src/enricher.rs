use std::collections::HashSet;
use std::time::Duration;

use futures::future::join_all;
use seace_adapters::{AdapterError, DetailExtractor, DetailLayout, DetailView};
use seace_core::{is_identifier, EnrichmentResult, ERROR, NOT_AVAILABLE};
use seace_storage::{
    BrowserError, BrowserSessionConfig, ChromiumDetailBrowser, DetailBrowser, DetailTab,
};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CONCURRENCY: usize = 5;

#[derive(Debug, Clone)]
pub struct EnrichConfig {
    /// Visits in flight per batch; also the batch size.
    pub concurrency: usize,
    pub batch_pause: Duration,
    pub cell_timeout: Duration,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            batch_pause: Duration::from_millis(500),
            cell_timeout: Duration::from_secs(7),
        }
    }
}

/// Visits detail pages in fixed-size batches and collects one CUBSO value per URL.
pub struct DetailEnricher {
    config: EnrichConfig,
    extractor: DetailExtractor,
}

impl DetailEnricher {
    pub fn new(config: EnrichConfig, layout: DetailLayout) -> Result<Self, AdapterError> {
        Ok(Self {
            config,
            extractor: DetailExtractor::new(layout)?,
        })
    }

    pub fn config(&self) -> &EnrichConfig {
        &self.config
    }

    /// Launch a request-filtered chromium session for `urls` and close it afterwards.
    pub async fn enrich_with_chromium(
        &self,
        session: &BrowserSessionConfig,
        urls: &[String],
    ) -> EnrichmentResult {
        if targets(urls).is_empty() {
            return EnrichmentResult::new();
        }

        let mut browser = match ChromiumDetailBrowser::launch(session).await {
            Ok(browser) => browser,
            Err(err) => {
                error!(error = %err, "could not start detail browser");
                return EnrichmentResult::new();
            }
        };
        let result = self.enrich(&browser, urls).await;
        if let Err(err) = browser.close().await {
            warn!(error = %err, "closing detail browser failed");
        }
        result
    }

    /// Look up every distinct non-empty URL. Failed visits map to `"Error"`, clean pages
    /// without an identifier to `"not available"`.
    pub async fn enrich<B>(&self, browser: &B, urls: &[String]) -> EnrichmentResult
    where
        B: DetailBrowser + ?Sized,
    {
        let targets = targets(urls);
        let batch_size = self.config.concurrency.max(1);
        let batches = targets.len().div_ceil(batch_size);
        let mut result = EnrichmentResult::new();

        info!(urls = targets.len(), batches, batch_size, "enriching detail pages");
        for (index, batch) in targets.chunks(batch_size).enumerate() {
            if index > 0 {
                sleep(self.config.batch_pause).await;
            }

            let values = join_all(batch.iter().map(|url| self.visit(browser, url))).await;
            let found = values.iter().filter(|value| is_identifier(value)).count();
            for (url, value) in batch.iter().zip(values) {
                result.insert(*url, value);
            }
            info!(
                batch = index + 1,
                batches,
                size = batch.len(),
                found,
                "detail batch finished"
            );
        }

        info!(
            urls = result.len(),
            found = result.found_count(),
            errors = result.error_count(),
            "detail enrichment finished"
        );
        result
    }

    async fn visit<B>(&self, browser: &B, url: &str) -> String
    where
        B: DetailBrowser + ?Sized,
    {
        match self.lookup(browser, url).await {
            Ok(Some(value)) => {
                debug!(url, cubso = %value, "identifier found");
                value
            }
            Ok(None) => NOT_AVAILABLE.to_string(),
            Err(err) => {
                warn!(url, error = %err, "detail page failed");
                ERROR.to_string()
            }
        }
    }

    async fn lookup<B>(&self, browser: &B, url: &str) -> Result<Option<String>, BrowserError>
    where
        B: DetailBrowser + ?Sized,
    {
        let mut tab = browser.open_tab().await?;
        let outcome = self.read(tab.as_mut(), url).await;
        if let Err(err) = tab.close().await {
            debug!(url, error = %err, "closing detail tab failed");
        }
        outcome
    }

    async fn read(
        &self,
        tab: &mut dyn DetailTab,
        url: &str,
    ) -> Result<Option<String>, BrowserError> {
        tab.goto(url).await?;
        let cell_text = match tab
            .wait_for_text(&self.extractor.layout().cell_selector, self.config.cell_timeout)
            .await
        {
            Ok(text) => text,
            Err(err) => {
                debug!(url, error = %err, "CUBSO cell lookup failed");
                None
            }
        };
        let markup = tab.content().await?;
        Ok(self.extractor.extract(&DetailView { cell_text, markup }))
    }
}

fn targets(urls: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    urls.iter()
        .map(|url| url.trim())
        .filter(|url| !url.is_empty() && seen.insert(*url))
        .collect()
}

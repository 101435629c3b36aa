use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use seace_adapters::{AdapterError, ListingLayout, SeaceAdapter, SEACE_URL};
use seace_core::{DateRange, PageSize, TenderRecord};
use seace_storage::{
    page_dump_name, BrowserSessionConfig, ChromiumListingDriver, ControlState, DiagnosticStore,
    ListingDriver, ScrollPosition, INITIAL_LOAD_DUMP,
};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Fixed pauses and bounded waits of one listing crawl.
#[derive(Debug, Clone)]
pub struct CrawlTimings {
    pub app_settle: Duration,
    pub page_size_wait: Duration,
    pub option_pause: Duration,
    pub page_size_settle: Duration,
    pub post_config_settle: Duration,
    pub results_wait: Duration,
    pub results_attempts: u32,
    pub results_retry_delay: Duration,
    pub search_settle: Duration,
    pub scroll_bottom_pause: Duration,
    pub scroll_top_pause: Duration,
    pub next_settle: Duration,
    pub idle_timeout: Duration,
}

impl Default for CrawlTimings {
    fn default() -> Self {
        Self {
            app_settle: Duration::from_secs(5),
            page_size_wait: Duration::from_secs(10),
            option_pause: Duration::from_millis(500),
            page_size_settle: Duration::from_secs(2),
            post_config_settle: Duration::from_secs(3),
            results_wait: Duration::from_secs(10),
            results_attempts: 5,
            results_retry_delay: Duration::from_secs(3),
            search_settle: Duration::from_secs(5),
            scroll_bottom_pause: Duration::from_millis(1500),
            scroll_top_pause: Duration::from_secs(1),
            next_settle: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub portal_url: String,
    pub layout: ListingLayout,
    pub timings: CrawlTimings,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            portal_url: SEACE_URL.to_string(),
            layout: ListingLayout::default(),
            timings: CrawlTimings::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlRequest {
    pub range: DateRange,
    pub max_pages: u32,
    pub page_size: PageSize,
}

/// In-range records plus the counters reported at the end of a crawl.
#[derive(Debug, Clone, Default)]
pub struct CrawlOutcome {
    pub records: Vec<TenderRecord>,
    pub total_extracted: usize,
    pub pages_processed: u32,
    pub card_failures: usize,
}

pub struct ListingCrawler {
    config: CrawlConfig,
    adapter: SeaceAdapter,
    diagnostics: DiagnosticStore,
}

impl ListingCrawler {
    pub fn new(config: CrawlConfig, diagnostics: DiagnosticStore) -> Result<Self, AdapterError> {
        let adapter = SeaceAdapter::new(&config.portal_url, config.layout.clone())?;
        Ok(Self {
            config,
            adapter,
            diagnostics,
        })
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    /// Launch a chromium session, crawl, and tear the session down.
    pub async fn crawl_with_chromium(
        &self,
        session: &BrowserSessionConfig,
        request: &CrawlRequest,
    ) -> CrawlOutcome {
        match ChromiumListingDriver::launch(session).await {
            Ok(mut driver) => self.crawl(&mut driver, request).await,
            Err(err) => {
                error!(error = %err, "could not start listing browser");
                CrawlOutcome::default()
            }
        }
    }

    /// Walk the listing pages and keep the records published inside `request.range`.
    ///
    /// Never fails: a fatal error is logged and yields an empty outcome. The driver is
    /// closed on every path.
    pub async fn crawl<D>(&self, driver: &mut D, request: &CrawlRequest) -> CrawlOutcome
    where
        D: ListingDriver + ?Sized,
    {
        let outcome = match self.run(driver, request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = ?err, "listing crawl aborted");
                CrawlOutcome::default()
            }
        };

        if let Err(err) = driver.close().await {
            warn!(error = %err, "closing listing browser failed");
        }

        info!(
            total_extracted = outcome.total_extracted,
            in_range = outcome.records.len(),
            pages_processed = outcome.pages_processed,
            max_pages = request.max_pages,
            range = %request.range,
            "listing crawl finished"
        );
        outcome
    }

    async fn run<D>(&self, driver: &mut D, request: &CrawlRequest) -> Result<CrawlOutcome>
    where
        D: ListingDriver + ?Sized,
    {
        let timings = &self.config.timings;

        if request.max_pages == 0 {
            warn!("page limit is zero, nothing to crawl");
            return Ok(CrawlOutcome::default());
        }

        info!(url = %self.config.portal_url, "loading listing page");
        driver
            .goto(&self.config.portal_url)
            .await
            .with_context(|| format!("navigating to {}", self.config.portal_url))?;
        self.settle(driver, timings.app_settle).await;

        if let Err(err) = self.configure_page_size(driver, request.page_size).await {
            warn!(error = %err, "could not configure page size, continuing with the active one");
        }
        sleep(timings.post_config_settle).await;

        self.wait_for_results(driver).await;

        let mut outcome = CrawlOutcome::default();
        let mut page_no: u32 = 1;
        loop {
            info!(page = page_no, max_pages = request.max_pages, "processing listing page");

            driver
                .scroll(ScrollPosition::Bottom)
                .await
                .context("scrolling to bottom")?;
            sleep(timings.scroll_bottom_pause).await;
            driver
                .scroll(ScrollPosition::Top)
                .await
                .context("scrolling to top")?;
            sleep(timings.scroll_top_pause).await;

            let markup = driver
                .content()
                .await
                .with_context(|| format!("reading markup of page {page_no}"))?;
            let page = self.adapter.parse_listing(&markup);

            if page.is_empty() {
                self.dump(&page_dump_name(page_no), &markup).await;
                if page_no == 1 {
                    warn!("no cards found on the first listing page");
                } else {
                    info!(page = page_no, "no more cards, end of results");
                }
                break;
            }

            for failure in &page.failures {
                warn!(
                    page = page_no,
                    card = failure.index,
                    error = %failure.error,
                    "skipping unparseable card"
                );
            }

            let cards = page.card_count();
            let parsed = page.records.len();
            let before = outcome.records.len();
            outcome.pages_processed = page_no;
            outcome.total_extracted += parsed;
            outcome.card_failures += page.failures.len();
            outcome.records.extend(
                page.records
                    .into_iter()
                    .filter(|record| request.range.contains_text(&record.publication_date)),
            );
            info!(
                page = page_no,
                selector = page.selector.as_deref().unwrap_or_default(),
                cards,
                parsed,
                in_range = outcome.records.len() - before,
                "listing page parsed"
            );

            if page_no >= request.max_pages {
                info!(max_pages = request.max_pages, "page limit reached");
                break;
            }

            match self.advance(driver).await {
                Ok(true) => page_no += 1,
                Ok(false) => break,
                Err(err) => {
                    info!(error = %err, "pagination ended");
                    break;
                }
            }
        }

        Ok(outcome)
    }

    async fn settle<D>(&self, driver: &mut D, pause: Duration)
    where
        D: ListingDriver + ?Sized,
    {
        if let Err(err) = driver.wait_for_idle(self.config.timings.idle_timeout).await {
            debug!(error = %err, "network did not go idle");
        }
        sleep(pause).await;
    }

    async fn configure_page_size<D>(&self, driver: &mut D, size: PageSize) -> Result<()>
    where
        D: ListingDriver + ?Sized,
    {
        let layout = self.adapter.layout();
        let timings = &self.config.timings;

        if !driver
            .wait_for(&layout.page_size_value, timings.page_size_wait)
            .await?
        {
            return Err(anyhow!("page size control not found"));
        }
        let current = driver.text_of(&layout.page_size_value).await?;
        let current_value = current.as_deref().and_then(|t| t.trim().parse::<u32>().ok());
        if current_value == Some(size.value()) {
            info!(%size, "page size already configured");
            return Ok(());
        }

        info!(
            from = current.as_deref().unwrap_or("unknown"),
            to = %size,
            "changing page size"
        );
        if !driver.click(&layout.page_size_trigger).await? {
            return Err(anyhow!("page size selector not found"));
        }
        sleep(timings.option_pause).await;
        let option = layout.page_size_option_for(size.value());
        if !driver.click(&option).await? {
            return Err(anyhow!("no page size option {option}"));
        }
        self.settle(driver, timings.page_size_settle).await;
        info!(%size, "page size configured");
        Ok(())
    }

    async fn wait_for_results<D>(&self, driver: &mut D)
    where
        D: ListingDriver + ?Sized,
    {
        let layout = self.adapter.layout();
        let timings = &self.config.timings;
        let attempts = timings.results_attempts.max(1);

        for attempt in 1..=attempts {
            match driver
                .wait_for(&layout.results_container, timings.results_wait)
                .await
            {
                Ok(true) => {
                    debug!(attempt, "results detected");
                    return;
                }
                Ok(false) => debug!(attempt, attempts, "results not visible yet"),
                Err(err) => debug!(attempt, attempts, error = %err, "waiting for results failed"),
            }
            if attempt < attempts {
                sleep(timings.results_retry_delay).await;
            }
        }

        warn!("results never appeared, saving markup and trying a blank search");
        match driver.content().await {
            Ok(markup) => self.dump(INITIAL_LOAD_DUMP, &markup).await,
            Err(err) => warn!(error = %err, "could not read markup for diagnostics"),
        }

        for button in &layout.search_buttons {
            match driver.click(button).await {
                Ok(true) => {
                    info!(%button, "triggered blank search");
                    self.settle(driver, timings.search_settle).await;
                    return;
                }
                Ok(false) => {}
                Err(err) => debug!(%button, error = %err, "search button click failed"),
            }
        }
    }

    /// Click the first visible next-page control. `Ok(false)` on the last page.
    async fn advance<D>(&self, driver: &mut D) -> Result<bool>
    where
        D: ListingDriver + ?Sized,
    {
        let layout = self.adapter.layout();
        for candidate in &layout.next_page {
            match driver.control_state(candidate).await? {
                ControlState::Missing | ControlState::Hidden => continue,
                ControlState::Disabled => {
                    info!("last listing page reached");
                    return Ok(false);
                }
                ControlState::Enabled => {
                    if !driver.click(candidate).await? {
                        return Ok(false);
                    }
                    debug!(control = %candidate, "moved to next page");
                    self.settle(driver, self.config.timings.next_settle).await;
                    return Ok(true);
                }
            }
        }
        info!("no next page control");
        Ok(false)
    }

    async fn dump(&self, name: &str, markup: &str) {
        match self.diagnostics.write_markup(name, markup).await {
            Ok(stored) => warn!(
                path = %stored.absolute_path.display(),
                bytes = stored.byte_size,
                "saved page markup for inspection"
            ),
            Err(err) => warn!(error = ?err, "could not save diagnostic markup"),
        }
    }
}

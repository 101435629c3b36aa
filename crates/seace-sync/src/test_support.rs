//! Scripted browser doubles shared by the crawler, enricher and pipeline tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use seace_adapters::ListingLayout;
use seace_storage::{
    BrowserError, ControlState, DetailBrowser, DetailTab, ListingDriver, Locator, ScrollPosition,
};

use crate::crawler::CrawlTimings;

pub fn instant_timings() -> CrawlTimings {
    CrawlTimings {
        app_settle: Duration::ZERO,
        page_size_wait: Duration::ZERO,
        option_pause: Duration::ZERO,
        page_size_settle: Duration::ZERO,
        post_config_settle: Duration::ZERO,
        results_wait: Duration::ZERO,
        results_attempts: 5,
        results_retry_delay: Duration::ZERO,
        search_settle: Duration::ZERO,
        scroll_bottom_pause: Duration::ZERO,
        scroll_top_pause: Duration::ZERO,
        next_settle: Duration::ZERO,
        idle_timeout: Duration::ZERO,
    }
}

pub fn card(code: &str, published: &str, description: &str) -> String {
    format!(
        r#"<div class="bg-fondo-section rounded-md p-4">
  <p class="font-semibold">{code}</p>
  <p class="font-semibold">MUNICIPALIDAD DISTRITAL DE MIRAFLORES</p>
  <p>{description}</p>
  <span class="bg-green-100 text-green-800">Vigente</span>
  <p>Fecha de publicación: {published} 09:15:00</p>
  <p>Cotizaciones: {published} 10:00:00 - {published} 18:00:00</p>
  <a href="/buscador-publico/contrataciones/{code}">Ver detalle</a>
</div>"#
    )
}

pub fn listing(cards: &[String]) -> String {
    format!("<html><body><main>{}</main></body></html>", cards.join("\n"))
}

pub fn empty_listing() -> String {
    "<html><body><main><p>No se encontraron resultados</p></main></body></html>".to_string()
}

/// Listing session replaying one markup snapshot per page.
pub struct FakeListing {
    pub layout: ListingLayout,
    pub pages: Vec<String>,
    pub current: usize,
    pub page_size: Option<String>,
    pub results_visible: bool,
    pub fail_content: bool,
    pub clicks: Vec<Locator>,
    pub closed: bool,
    /// Index into the layout's next-page candidates of the control that paginates.
    pub next_control: usize,
    /// Candidates rendered but not visible.
    pub hidden_controls: Vec<Locator>,
    /// On the last page the next control stays disabled; otherwise it disappears.
    pub disable_on_last: bool,
}

impl FakeListing {
    pub fn new(pages: Vec<String>) -> Self {
        Self {
            layout: ListingLayout::default(),
            pages,
            current: 0,
            page_size: Some("100".to_string()),
            results_visible: true,
            fail_content: false,
            clicks: Vec::new(),
            closed: false,
            next_control: 0,
            hidden_controls: Vec::new(),
            disable_on_last: true,
        }
    }

    pub fn next_clicks(&self) -> usize {
        self.clicks
            .iter()
            .filter(|locator| self.layout.next_page.contains(locator))
            .count()
    }

    pub fn clicked(&self, locator: &Locator) -> bool {
        self.clicks.contains(locator)
    }

    fn has_next(&self) -> bool {
        self.current + 1 < self.pages.len()
    }

    fn is_next_control(&self, locator: &Locator) -> bool {
        self.layout.next_page.get(self.next_control) == Some(locator)
    }
}

#[async_trait]
impl ListingDriver for FakeListing {
    async fn goto(&mut self, _url: &str) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn wait_for_idle(&mut self, _timeout: Duration) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn wait_for(
        &mut self,
        locator: &Locator,
        _timeout: Duration,
    ) -> Result<bool, BrowserError> {
        if *locator == self.layout.results_container {
            Ok(self.results_visible)
        } else if *locator == self.layout.page_size_value {
            Ok(self.page_size.is_some())
        } else {
            Ok(false)
        }
    }

    async fn text_of(&mut self, locator: &Locator) -> Result<Option<String>, BrowserError> {
        if *locator == self.layout.page_size_value {
            Ok(self.page_size.clone())
        } else {
            Ok(None)
        }
    }

    async fn click(&mut self, locator: &Locator) -> Result<bool, BrowserError> {
        self.clicks.push(locator.clone());
        if self.is_next_control(locator) {
            if self.has_next() {
                self.current += 1;
                return Ok(true);
            }
            return Ok(false);
        }
        if *locator == self.layout.page_size_trigger {
            return Ok(self.page_size.is_some());
        }
        if let Locator::CssExact { css, text } = locator {
            if *css == self.layout.page_size_option && self.page_size.is_some() {
                self.page_size = Some(text.clone());
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn control_state(&mut self, locator: &Locator) -> Result<ControlState, BrowserError> {
        if self.hidden_controls.contains(locator) {
            return Ok(ControlState::Hidden);
        }
        if !self.is_next_control(locator) {
            return Ok(ControlState::Missing);
        }
        Ok(if self.has_next() {
            ControlState::Enabled
        } else if self.disable_on_last {
            ControlState::Disabled
        } else {
            ControlState::Missing
        })
    }

    async fn scroll(&mut self, _position: ScrollPosition) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn content(&mut self) -> Result<String, BrowserError> {
        if self.fail_content {
            return Err(BrowserError::Message("renderer crashed".to_string()));
        }
        Ok(self.pages.get(self.current).cloned().unwrap_or_default())
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        self.closed = true;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum DetailPage {
    /// The CUBSO column cell renders with this text.
    Cell(&'static str),
    /// No live cell; the markup is all there is.
    Markup(&'static str),
    Unreachable,
    Slow,
}

#[derive(Debug, Default)]
pub struct DetailStats {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub active: AtomicUsize,
    pub peak: AtomicUsize,
    pub visited: Mutex<Vec<String>>,
}

impl DetailStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn visited(&self) -> Vec<String> {
        self.visited.lock().unwrap().clone()
    }
}

pub struct FakeDetailBrowser {
    pages: Arc<HashMap<String, DetailPage>>,
    pub stats: Arc<DetailStats>,
    pub closed: bool,
}

impl FakeDetailBrowser {
    pub fn new<'a>(pages: impl IntoIterator<Item = (&'a str, DetailPage)>) -> Self {
        Self {
            pages: Arc::new(
                pages
                    .into_iter()
                    .map(|(url, page)| (url.to_string(), page))
                    .collect(),
            ),
            stats: Arc::new(DetailStats::default()),
            closed: false,
        }
    }

    /// Every URL renders a page without any identifier.
    pub fn blank() -> Self {
        Self::new(Vec::<(&str, DetailPage)>::new())
    }
}

#[async_trait]
impl DetailBrowser for FakeDetailBrowser {
    async fn open_tab(&self) -> Result<Box<dyn DetailTab>, BrowserError> {
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTab {
            pages: Arc::clone(&self.pages),
            stats: Arc::clone(&self.stats),
            page: None,
        }))
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        self.closed = true;
        Ok(())
    }
}

struct FakeTab {
    pages: Arc<HashMap<String, DetailPage>>,
    stats: Arc<DetailStats>,
    page: Option<DetailPage>,
}

const BLANK: &str = "<html><body><p>Detalle del procedimiento</p></body></html>";

#[async_trait]
impl DetailTab for FakeTab {
    async fn goto(&mut self, url: &str) -> Result<(), BrowserError> {
        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak.fetch_max(active, Ordering::SeqCst);
        self.stats.visited.lock().unwrap().push(url.to_string());
        tokio::task::yield_now().await;

        match self.pages.get(url).cloned() {
            Some(DetailPage::Unreachable) => Err(BrowserError::Message(format!(
                "net::ERR_CONNECTION_RESET at {url}"
            ))),
            Some(DetailPage::Slow) => Err(BrowserError::Timeout {
                what: format!("navigation to {url}"),
                timeout: Duration::from_secs(60),
            }),
            page => {
                self.page = page;
                Ok(())
            }
        }
    }

    async fn wait_for_text(
        &mut self,
        _css: &str,
        _timeout: Duration,
    ) -> Result<Option<String>, BrowserError> {
        match &self.page {
            Some(DetailPage::Cell(text)) => Ok(Some(text.to_string())),
            _ => Ok(None),
        }
    }

    async fn content(&mut self) -> Result<String, BrowserError> {
        match &self.page {
            Some(DetailPage::Markup(markup)) => Ok(markup.to_string()),
            _ => Ok(BLANK.to_string()),
        }
    }

    async fn close(self: Box<Self>) -> Result<(), BrowserError> {
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

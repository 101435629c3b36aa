use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams, RequestPattern,
    RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{ErrorReason, ResourceType};
use chromiumoxide::element::Element;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::Page;
use futures::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

const CONTROL_STATE_JS: &str = r#"function() {
    const style = window.getComputedStyle(this);
    const rect = this.getBoundingClientRect();
    if (style.display === 'none' || style.visibility === 'hidden' || (rect.width === 0 && rect.height === 0)) {
        return 'hidden';
    }
    if (this.disabled || this.getAttribute('aria-disabled') === 'true') {
        return 'disabled';
    }
    return 'enabled';
}"#;

const IDLE_PROBE_JS: &str =
    "[document.readyState, performance.getEntriesByType('resource').length]";

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error(transparent)]
    Cdp(#[from] CdpError),
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },
    #[error("unexpected script result: {0}")]
    Script(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

/// Launch options shared by the listing and detail sessions.
#[derive(Debug, Clone)]
pub struct BrowserSessionConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub window_size: (u32, u32),
    pub navigation_timeout: Duration,
    pub executable: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

impl Default for BrowserSessionConfig {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: Some(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
            ),
            window_size: (1920, 1080),
            navigation_timeout: Duration::from_secs(60),
            executable: None,
            extra_args: vec![
                "--disable-setuid-sandbox".to_string(),
                "--disable-dev-shm-usage".to_string(),
                "--disable-gpu".to_string(),
                "--disable-software-rasterizer".to_string(),
            ],
        }
    }
}

/// How a control is found on the rendered page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Css(String),
    /// CSS match whose visible text contains `text`, case-insensitive.
    CssContaining { css: String, text: String },
    /// CSS match whose trimmed visible text equals `text`.
    CssExact { css: String, text: String },
}

impl Locator {
    pub fn css(css: impl Into<String>) -> Self {
        Locator::Css(css.into())
    }

    pub fn containing(css: impl Into<String>, text: impl Into<String>) -> Self {
        Locator::CssContaining {
            css: css.into(),
            text: text.into(),
        }
    }

    pub fn exact(css: impl Into<String>, text: impl Into<String>) -> Self {
        Locator::CssExact {
            css: css.into(),
            text: text.into(),
        }
    }

    pub fn css_selector(&self) -> &str {
        match self {
            Locator::Css(css) => css,
            Locator::CssContaining { css, .. } | Locator::CssExact { css, .. } => css,
        }
    }

    pub fn filters_text(&self) -> bool {
        !matches!(self, Locator::Css(_))
    }

    /// Whether an element with this visible text satisfies the locator.
    pub fn accepts_text(&self, text: &str) -> bool {
        match self {
            Locator::Css(_) => true,
            Locator::CssContaining { text: needle, .. } => {
                text.to_lowercase().contains(&needle.to_lowercase())
            }
            Locator::CssExact { text: expected, .. } => text.trim() == expected.trim(),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(css) => write!(f, "{css}"),
            Locator::CssContaining { css, text } => write!(f, "{css} containing {text:?}"),
            Locator::CssExact { css, text } => write!(f, "{css} with text {text:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Missing,
    Hidden,
    Disabled,
    Enabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollPosition {
    Top,
    Bottom,
}

/// Browser session driving the paginated listing UI.
#[async_trait]
pub trait ListingDriver: Send {
    async fn goto(&mut self, url: &str) -> Result<(), BrowserError>;

    /// Wait until the document is loaded and no new resources arrive.
    async fn wait_for_idle(&mut self, timeout: Duration) -> Result<(), BrowserError>;

    /// Poll for `locator`; `Ok(false)` when it never appears within `timeout`.
    async fn wait_for(&mut self, locator: &Locator, timeout: Duration)
        -> Result<bool, BrowserError>;

    async fn text_of(&mut self, locator: &Locator) -> Result<Option<String>, BrowserError>;

    /// Click the first match; `Ok(false)` when nothing matches.
    async fn click(&mut self, locator: &Locator) -> Result<bool, BrowserError>;

    async fn control_state(&mut self, locator: &Locator) -> Result<ControlState, BrowserError>;

    async fn scroll(&mut self, position: ScrollPosition) -> Result<(), BrowserError>;

    async fn content(&mut self) -> Result<String, BrowserError>;

    async fn close(&mut self) -> Result<(), BrowserError>;
}

/// Shared session opening one isolated tab per detail page.
#[async_trait]
pub trait DetailBrowser: Send + Sync {
    async fn open_tab(&self) -> Result<Box<dyn DetailTab>, BrowserError>;

    async fn close(&mut self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait DetailTab: Send {
    async fn goto(&mut self, url: &str) -> Result<(), BrowserError>;

    async fn wait_for_text(
        &mut self,
        css: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BrowserError>;

    async fn content(&mut self) -> Result<String, BrowserError>;

    async fn close(self: Box<Self>) -> Result<(), BrowserError>;
}

/// Resource types aborted on detail pages: images, stylesheets and fonts.
pub fn blocks_resource(resource: &ResourceType) -> bool {
    matches!(
        resource,
        ResourceType::Image | ResourceType::Stylesheet | ResourceType::Font
    )
}

struct ChromiumSession {
    browser: Browser,
    handler: JoinHandle<()>,
    config: BrowserSessionConfig,
}

impl ChromiumSession {
    async fn launch(config: &BrowserSessionConfig) -> Result<Self, BrowserError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(config.window_size.0, config.window_size.1)
            .request_timeout(config.navigation_timeout)
            .args(config.extra_args.clone());
        if !config.headless {
            builder = builder.with_head();
        }
        if let Some(executable) = &config.executable {
            builder = builder.chrome_executable(executable);
        }
        let browser_config = builder.build().map_err(BrowserError::Launch)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "browser handler event error");
                }
            }
        });

        Ok(Self {
            browser,
            handler,
            config: config.clone(),
        })
    }

    async fn new_page(&self) -> Result<Page, BrowserError> {
        let page = self.browser.new_page("about:blank").await?;
        if let Some(user_agent) = &self.config.user_agent {
            page.execute(SetUserAgentOverrideParams::new(user_agent.clone()))
                .await?;
        }
        Ok(page)
    }

    async fn shutdown(mut self) -> Result<(), BrowserError> {
        let closed = self.browser.close().await;
        if let Err(err) = self.browser.wait().await {
            debug!(error = %err, "waiting for browser process exit");
        }
        self.handler.abort();
        closed.map(|_| ()).map_err(BrowserError::from)
    }
}

async fn navigate(page: &Page, url: &str, timeout: Duration) -> Result<(), BrowserError> {
    match tokio::time::timeout(timeout, page.goto(url)).await {
        Ok(result) => result.map(|_| ()).map_err(BrowserError::from),
        Err(_) => Err(BrowserError::Timeout {
            what: format!("navigation to {url}"),
            timeout,
        }),
    }
}

async fn find_first(page: &Page, locator: &Locator) -> Result<Option<Element>, BrowserError> {
    let elements = page.find_elements(locator.css_selector()).await?;
    if !locator.filters_text() {
        return Ok(elements.into_iter().next());
    }
    for element in elements {
        let text = element.inner_text().await?.unwrap_or_default();
        if locator.accepts_text(&text) {
            return Ok(Some(element));
        }
    }
    Ok(None)
}

/// Chromium tab walking the listing pages.
pub struct ChromiumListingDriver {
    session: Option<ChromiumSession>,
    page: Page,
    navigation_timeout: Duration,
}

impl ChromiumListingDriver {
    pub async fn launch(config: &BrowserSessionConfig) -> Result<Self, BrowserError> {
        let session = ChromiumSession::launch(config).await?;
        let page = match session.new_page().await {
            Ok(page) => page,
            Err(err) => {
                if let Err(close_err) = session.shutdown().await {
                    warn!(error = %close_err, "closing browser after failed page setup");
                }
                return Err(err);
            }
        };
        Ok(Self {
            session: Some(session),
            page,
            navigation_timeout: config.navigation_timeout,
        })
    }
}

#[async_trait]
impl ListingDriver for ChromiumListingDriver {
    async fn goto(&mut self, url: &str) -> Result<(), BrowserError> {
        navigate(&self.page, url, self.navigation_timeout).await
    }

    async fn wait_for_idle(&mut self, timeout: Duration) -> Result<(), BrowserError> {
        let deadline = Instant::now() + timeout;
        let mut last_count: Option<u64> = None;
        loop {
            let (ready_state, resource_count): (String, u64) =
                self.page.evaluate(IDLE_PROBE_JS).await?.into_value()?;
            if ready_state == "complete" && last_count == Some(resource_count) {
                return Ok(());
            }
            last_count = Some(resource_count);
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout {
                    what: "network idle".to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }

    async fn wait_for(
        &mut self,
        locator: &Locator,
        timeout: Duration,
    ) -> Result<bool, BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            if find_first(&self.page, locator).await?.is_some() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn text_of(&mut self, locator: &Locator) -> Result<Option<String>, BrowserError> {
        match find_first(&self.page, locator).await? {
            Some(element) => Ok(element.inner_text().await?),
            None => Ok(None),
        }
    }

    async fn click(&mut self, locator: &Locator) -> Result<bool, BrowserError> {
        match find_first(&self.page, locator).await? {
            Some(element) => {
                element.click().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn control_state(&mut self, locator: &Locator) -> Result<ControlState, BrowserError> {
        let Some(element) = find_first(&self.page, locator).await? else {
            return Ok(ControlState::Missing);
        };
        let returns = element.call_js_fn(CONTROL_STATE_JS, false).await?;
        let state = returns
            .result
            .value
            .as_ref()
            .and_then(|v| v.as_str())
            .unwrap_or("hidden");
        Ok(match state {
            "enabled" => ControlState::Enabled,
            "disabled" => ControlState::Disabled,
            _ => ControlState::Hidden,
        })
    }

    async fn scroll(&mut self, position: ScrollPosition) -> Result<(), BrowserError> {
        let script = match position {
            ScrollPosition::Top => "window.scrollTo(0, 0)",
            ScrollPosition::Bottom => "window.scrollTo(0, document.body.scrollHeight)",
        };
        self.page.evaluate(script).await?;
        Ok(())
    }

    async fn content(&mut self) -> Result<String, BrowserError> {
        Ok(self.page.content().await?)
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        match self.session.take() {
            Some(session) => session.shutdown().await,
            None => Ok(()),
        }
    }
}

/// Chromium session handing out request-filtered tabs for detail pages.
pub struct ChromiumDetailBrowser {
    session: Option<ChromiumSession>,
}

impl ChromiumDetailBrowser {
    pub async fn launch(config: &BrowserSessionConfig) -> Result<Self, BrowserError> {
        Ok(Self {
            session: Some(ChromiumSession::launch(config).await?),
        })
    }
}

#[async_trait]
impl DetailBrowser for ChromiumDetailBrowser {
    async fn open_tab(&self) -> Result<Box<dyn DetailTab>, BrowserError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| BrowserError::Message("detail browser already closed".to_string()))?;
        let page = session.new_page().await?;

        let mut paused = page.event_listener::<EventRequestPaused>().await?;
        page.execute(
            EnableParams::builder()
                .pattern(
                    RequestPattern::builder()
                        .url_pattern("*")
                        .request_stage(RequestStage::Request)
                        .build(),
                )
                .build(),
        )
        .await?;

        let router = page.clone();
        let interceptor = tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let outcome = if blocks_resource(&event.resource_type) {
                    router
                        .execute(FailRequestParams::new(
                            event.request_id.clone(),
                            ErrorReason::BlockedByClient,
                        ))
                        .await
                        .map(|_| ())
                } else {
                    router
                        .execute(ContinueRequestParams::new(event.request_id.clone()))
                        .await
                        .map(|_| ())
                };
                if let Err(err) = outcome {
                    debug!(error = %err, "request interception step failed");
                }
            }
        });

        Ok(Box::new(ChromiumDetailTab {
            page,
            interceptor,
            navigation_timeout: session.config.navigation_timeout,
        }))
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        match self.session.take() {
            Some(session) => session.shutdown().await,
            None => Ok(()),
        }
    }
}

pub struct ChromiumDetailTab {
    page: Page,
    interceptor: JoinHandle<()>,
    navigation_timeout: Duration,
}

#[async_trait]
impl DetailTab for ChromiumDetailTab {
    async fn goto(&mut self, url: &str) -> Result<(), BrowserError> {
        navigate(&self.page, url, self.navigation_timeout).await
    }

    async fn wait_for_text(
        &mut self,
        css: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BrowserError> {
        let locator = Locator::css(css);
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(element) = find_first(&self.page, &locator).await? {
                return Ok(element.inner_text().await?);
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn content(&mut self) -> Result<String, BrowserError> {
        Ok(self.page.content().await?)
    }

    async fn close(self: Box<Self>) -> Result<(), BrowserError> {
        let ChromiumDetailTab {
            page, interceptor, ..
        } = *self;
        interceptor.abort();
        page.close().await?;
        Ok(())
    }
}

//! SEACE portal markup knowledge: selector layouts, card parsing, CUBSO extraction.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use seace_core::{TenderRecord, NOT_AVAILABLE, PUBLICATION_LABELS};
use seace_storage::Locator;
use thiserror::Error;
use tracing::warn;
use url::Url;

pub const CRATE_NAME: &str = "seace-adapters";

pub const SEACE_URL: &str = "https://prod6.seace.gob.pe/buscador-publico/contrataciones";

/// Object-type prefixes opening the description paragraph.
pub const DESCRIPTION_PREFIXES: &[&str] = &[
    "Servicio:",
    "Bien:",
    "Obra:",
    "Consultoría:",
    "Consultoria:",
    "Service:",
    "Good:",
    "Work:",
    "Consulting:",
];

pub const QUOTATION_LABELS: &[&str] = &["Cotizaciones:", "Cotización:", "Quotations:", "Quotation:"];

/// Lowercased tokens that disqualify a paragraph from being the entity name.
const ENTITY_EXCLUDED_TOKENS: &[&str] = &[
    "servicio:",
    "bien:",
    "obra:",
    "consultoría:",
    "consultoria:",
    "service:",
    "good:",
    "work:",
    "consulting:",
    "fecha",
    "publication date",
    "cotizaci",
    "quotation",
];

const ENTITY_MIN_CHARS: usize = 20;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("invalid identifier pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("invalid base url: {0}")]
    BaseUrl(#[from] url::ParseError),
    #[error("card has no text content")]
    EmptyCard,
}

/// Where things live on the listing page. Lists are ordered fallbacks.
#[derive(Debug, Clone)]
pub struct ListingLayout {
    pub card_selectors: Vec<String>,
    pub bold_label: String,
    pub paragraph: String,
    pub badge: String,
    pub detail_links: Vec<String>,
    pub results_container: Locator,
    pub page_size_value: Locator,
    pub page_size_trigger: Locator,
    pub page_size_option: String,
    pub next_page: Vec<Locator>,
    pub search_buttons: Vec<Locator>,
}

impl Default for ListingLayout {
    fn default() -> Self {
        Self {
            card_selectors: vec![
                "div.bg-fondo-section".to_string(),
                "div[class*='bg-fondo']".to_string(),
                "div.rounded-md".to_string(),
                "app-card-contratacion".to_string(),
                "div[class*='card']".to_string(),
            ],
            bold_label: "p.font-semibold".to_string(),
            paragraph: "p".to_string(),
            badge: "span[class*='bg-']".to_string(),
            detail_links: vec![
                "a[href*='/buscador-publico/contrataciones/']".to_string(),
                "a[href*='/contrataciones/']".to_string(),
            ],
            results_container: Locator::css("div[class*='rounded']"),
            page_size_value: Locator::css("span.mat-mdc-select-min-line"),
            page_size_trigger: Locator::css(
                "mat-select[aria-labelledby*='mat-paginator-page-size-label']",
            ),
            page_size_option: "mat-option[role='option']".to_string(),
            next_page: vec![
                Locator::css("button[aria-label='Siguiente página']"),
                Locator::css("button[aria-label*='Next']"),
                Locator::containing("button", "›"),
                Locator::containing("button", "Siguiente"),
            ],
            search_buttons: vec![
                Locator::containing("button", "buscar"),
                Locator::containing("button", "search"),
            ],
        }
    }
}

impl ListingLayout {
    pub fn page_size_option_for(&self, size: u32) -> Locator {
        Locator::exact(self.page_size_option.clone(), size.to_string())
    }
}

/// Where the CUBSO identifier lives on a detail page.
#[derive(Debug, Clone)]
pub struct DetailLayout {
    pub cell_selector: String,
    pub label: String,
    pub min_digits: usize,
}

impl Default for DetailLayout {
    fn default() -> Self {
        Self {
            cell_selector: "td.mat-column-codCubso, td[class*='codCubso']".to_string(),
            label: "CUBSO".to_string(),
            min_digits: 10,
        }
    }
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn strip_labels(text: &str, labels: &[&str]) -> String {
    labels
        .iter()
        .fold(text.to_string(), |acc, label| acc.replace(label, ""))
        .trim()
        .to_string()
}

#[derive(Debug)]
pub struct CardFailure {
    pub index: usize,
    pub error: AdapterError,
}

/// Parsed cards of one rendered listing page.
#[derive(Debug, Default)]
pub struct ListingPage {
    /// Card selector that matched, if any did.
    pub selector: Option<String>,
    pub records: Vec<TenderRecord>,
    pub failures: Vec<CardFailure>,
}

impl ListingPage {
    pub fn card_count(&self) -> usize {
        self.records.len() + self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.card_count() == 0
    }
}

struct CardView {
    bolds: Vec<String>,
    paragraphs: Vec<String>,
    badge: Option<String>,
    links: Vec<String>,
}

type FieldExtractor = fn(&CardView) -> Option<String>;

fn extract_first(view: &CardView, extractors: &[FieldExtractor]) -> Option<String> {
    extractors.iter().find_map(|extract| extract(view))
}

fn first_bold(view: &CardView) -> Option<String> {
    view.bolds.first().cloned()
}

fn second_bold(view: &CardView) -> Option<String> {
    view.bolds.get(1).cloned()
}

fn long_paragraph(view: &CardView) -> Option<String> {
    let code = view.bolds.first();
    view.paragraphs
        .iter()
        .find(|text| {
            let lowered = text.to_lowercase();
            text.chars().count() > ENTITY_MIN_CHARS
                && Some(*text) != code
                && !ENTITY_EXCLUDED_TOKENS.iter().any(|t| lowered.contains(t))
        })
        .cloned()
}

fn prefixed_description(view: &CardView) -> Option<String> {
    view.paragraphs.iter().find_map(|text| {
        DESCRIPTION_PREFIXES
            .iter()
            .find_map(|prefix| text.strip_prefix(prefix))
            .map(|rest| rest.trim().to_string())
    })
}

fn badge(view: &CardView) -> Option<String> {
    view.badge.clone()
}

fn publication_date(view: &CardView) -> Option<String> {
    view.paragraphs
        .iter()
        .find(|text| PUBLICATION_LABELS.iter().any(|label| text.contains(label)))
        .map(|text| strip_labels(text, PUBLICATION_LABELS))
}

fn quotation_dates(view: &CardView) -> Option<String> {
    view.paragraphs
        .iter()
        .find(|text| QUOTATION_LABELS.iter().any(|label| text.contains(label)))
        .map(|text| strip_labels(text, QUOTATION_LABELS))
}

fn detail_link(view: &CardView) -> Option<String> {
    view.links.first().cloned()
}

const CODE_EXTRACTORS: &[FieldExtractor] = &[first_bold];
const ENTITY_EXTRACTORS: &[FieldExtractor] = &[second_bold, long_paragraph];
const DESCRIPTION_EXTRACTORS: &[FieldExtractor] = &[prefixed_description];
const STATUS_EXTRACTORS: &[FieldExtractor] = &[badge];
const PUBLICATION_EXTRACTORS: &[FieldExtractor] = &[publication_date];
const QUOTATION_EXTRACTORS: &[FieldExtractor] = &[quotation_dates];
const LINK_EXTRACTORS: &[FieldExtractor] = &[detail_link];

/// Listing-card parser bound to one portal base URL and layout.
#[derive(Debug)]
pub struct SeaceAdapter {
    base_url: Url,
    layout: ListingLayout,
    cards: Vec<(String, Selector)>,
    bold: Selector,
    paragraph: Selector,
    badge: Selector,
    links: Vec<Selector>,
}

impl SeaceAdapter {
    pub fn new(base_url: &str, layout: ListingLayout) -> Result<Self, AdapterError> {
        let base_url = Url::parse(base_url)?;
        let cards = layout
            .card_selectors
            .iter()
            .map(|s| compile(s).map(|sel| (s.clone(), sel)))
            .collect::<Result<Vec<_>, _>>()?;
        let links = layout
            .detail_links
            .iter()
            .map(|s| compile(s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            bold: compile(&layout.bold_label)?,
            paragraph: compile(&layout.paragraph)?,
            badge: compile(&layout.badge)?,
            base_url,
            layout,
            cards,
            links,
        })
    }

    pub fn seace() -> Result<Self, AdapterError> {
        Self::new(SEACE_URL, ListingLayout::default())
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn layout(&self) -> &ListingLayout {
        &self.layout
    }

    /// Locate cards with the first selector that matches and parse each one.
    pub fn parse_listing(&self, markup: &str) -> ListingPage {
        let document = Html::parse_document(markup);
        let Some((selector, cards)) = self.cards.iter().find_map(|(name, sel)| {
            let found: Vec<ElementRef<'_>> = document.select(sel).collect();
            (!found.is_empty()).then_some((name, found))
        }) else {
            return ListingPage::default();
        };

        let mut page = ListingPage {
            selector: Some(selector.clone()),
            ..ListingPage::default()
        };
        for (index, card) in cards.into_iter().enumerate() {
            match self.parse_card(card) {
                Ok(record) => page.records.push(record),
                Err(error) => page.failures.push(CardFailure {
                    index: index + 1,
                    error,
                }),
            }
        }
        page
    }

    /// Parse a standalone card fragment.
    pub fn parse_card_fragment(&self, fragment: &str) -> Result<TenderRecord, AdapterError> {
        let html = Html::parse_fragment(fragment);
        self.parse_card(html.root_element())
    }

    fn parse_card(&self, card: ElementRef<'_>) -> Result<TenderRecord, AdapterError> {
        if element_text(card).is_empty() {
            return Err(AdapterError::EmptyCard);
        }

        let view = CardView {
            bolds: card
                .select(&self.bold)
                .filter_map(|e| text_or_none(element_text(e)))
                .collect(),
            paragraphs: card
                .select(&self.paragraph)
                .filter_map(|e| text_or_none(element_text(e)))
                .collect(),
            badge: card
                .select(&self.badge)
                .find_map(|e| text_or_none(element_text(e))),
            links: self.resolve_links(card),
        };

        let or_sentinel = |value: Option<String>| value.unwrap_or_else(|| NOT_AVAILABLE.to_string());
        Ok(TenderRecord {
            process_code: or_sentinel(extract_first(&view, CODE_EXTRACTORS)),
            entity: or_sentinel(extract_first(&view, ENTITY_EXTRACTORS)),
            description: or_sentinel(extract_first(&view, DESCRIPTION_EXTRACTORS)),
            status: or_sentinel(extract_first(&view, STATUS_EXTRACTORS)),
            publication_date: or_sentinel(extract_first(&view, PUBLICATION_EXTRACTORS)),
            quotation_dates: or_sentinel(extract_first(&view, QUOTATION_EXTRACTORS)),
            detail_url: extract_first(&view, LINK_EXTRACTORS).unwrap_or_default(),
            ..TenderRecord::default()
        })
    }

    fn resolve_links(&self, card: ElementRef<'_>) -> Vec<String> {
        self.links
            .iter()
            .filter_map(|sel| {
                card.select(sel)
                    .find_map(|a| a.value().attr("href").and_then(|h| text_or_none(h.to_string())))
            })
            .filter_map(|href| match self.base_url.join(&href) {
                Ok(url) => Some(url.to_string()),
                Err(err) => {
                    warn!(href = %href, error = %err, "unresolvable detail link");
                    None
                }
            })
            .collect()
    }
}

/// What a detail tab yielded: the live cell text (if the cell rendered) and the full markup.
#[derive(Debug, Clone, Default)]
pub struct DetailView {
    pub cell_text: Option<String>,
    pub markup: String,
}

type DetailStrategy = fn(&DetailExtractor, &DetailView) -> Option<String>;

/// Ordered CUBSO extraction strategies; the first value found wins.
#[derive(Debug)]
pub struct DetailExtractor {
    layout: DetailLayout,
    cell: Selector,
    header: Selector,
    pattern: Regex,
}

impl DetailExtractor {
    const STRATEGIES: [DetailStrategy; 3] = [
        DetailExtractor::from_cell,
        DetailExtractor::from_table,
        DetailExtractor::from_pattern,
    ];

    pub fn new(layout: DetailLayout) -> Result<Self, AdapterError> {
        let pattern = Regex::new(&format!(
            r"(?i){}[:\s]*(\d{{{},}})",
            regex::escape(&layout.label),
            layout.min_digits
        ))?;
        Ok(Self {
            cell: compile("td")?,
            header: compile("th")?,
            pattern,
            layout,
        })
    }

    pub fn layout(&self) -> &DetailLayout {
        &self.layout
    }

    pub fn extract(&self, view: &DetailView) -> Option<String> {
        Self::STRATEGIES
            .iter()
            .find_map(|strategy| strategy(self, view))
    }

    fn from_cell(&self, view: &DetailView) -> Option<String> {
        view.cell_text.clone().and_then(text_or_none)
    }

    fn from_table(&self, view: &DetailView) -> Option<String> {
        let document = Html::parse_document(&view.markup);
        let label = self.layout.label.to_lowercase();
        document.select(&self.cell).find_map(|td| {
            let text = element_text(td);
            if text.len() < self.layout.min_digits || !text.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let mut ancestors = td.ancestors().filter_map(ElementRef::wrap);
            if !ancestors.any(|e| e.value().name() == "tr") {
                return None;
            }
            let table = ancestors.find(|e| e.value().name() == "table")?;
            table
                .select(&self.header)
                .any(|th| element_text(th).to_lowercase().contains(&label))
                .then_some(text)
        })
    }

    fn from_pattern(&self, view: &DetailView) -> Option<String> {
        self.pattern
            .captures(&view.markup)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

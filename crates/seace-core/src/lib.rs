//! Core domain model for the SEACE tender pipeline: records, date window, sectors.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "seace-core";

/// Stand-in for a field that was absent from the source markup.
pub const NOT_AVAILABLE: &str = "not available";

/// Stand-in for an identifier whose detail page failed to load or extract.
pub const ERROR: &str = "Error";

/// Labels the portal prints in front of the publication date.
pub const PUBLICATION_LABELS: &[&str] = &["Fecha de publicación:", "Publication date:"];

const PORTAL_DATE_FORMAT: &str = "%d/%m/%Y";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid date {0:?}, expected dd/mm/yyyy")]
    InvalidDate(String),
    #[error("date range start {start} is after end {end}")]
    InvertedRange { start: NaiveDate, end: NaiveDate },
    #[error("unsupported page size {0:?}, expected one of 5, 10, 25, 100")]
    InvalidPageSize(String),
    #[error("invalid sector rules: {0}")]
    InvalidRules(String),
}

/// One tender as rendered by a listing card, later enriched with CUBSO and sector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenderRecord {
    pub process_code: String,
    pub entity: String,
    pub description: String,
    pub status: String,
    pub publication_date: String,
    pub quotation_dates: String,
    /// Absolute detail-page URL; empty when the card carried no link.
    pub detail_url: String,
    pub cubso: String,
    pub sector: String,
}

impl Default for TenderRecord {
    fn default() -> Self {
        Self {
            process_code: NOT_AVAILABLE.to_string(),
            entity: NOT_AVAILABLE.to_string(),
            description: NOT_AVAILABLE.to_string(),
            status: NOT_AVAILABLE.to_string(),
            publication_date: NOT_AVAILABLE.to_string(),
            quotation_dates: NOT_AVAILABLE.to_string(),
            detail_url: String::new(),
            cubso: NOT_AVAILABLE.to_string(),
            sector: String::new(),
        }
    }
}

impl TenderRecord {
    pub fn has_detail_url(&self) -> bool {
        !self.detail_url.trim().is_empty()
    }
}

/// Parse portal date text (`dd/mm/yyyy` with optional time and label) into a calendar date.
pub fn parse_portal_date(text: &str) -> Option<NaiveDate> {
    let mut cleaned = text.trim();
    for label in PUBLICATION_LABELS {
        if let Some(rest) = cleaned.strip_prefix(label) {
            cleaned = rest.trim();
            break;
        }
    }
    let day = cleaned.split_whitespace().next()?;
    parse_date_token(day)
}

/// `%Y` alone accepts signs and any digit count; only `d/m/yyyy` shaped tokens get through.
fn parse_date_token(token: &str) -> Option<NaiveDate> {
    let mut parts = token.split('/');
    let (day, month, year) = (parts.next()?, parts.next()?, parts.next()?);
    let digits = |part: &str, min: usize, max: usize| {
        (min..=max).contains(&part.len()) && part.bytes().all(|b| b.is_ascii_digit())
    };
    if parts.next().is_some() || !digits(day, 1, 2) || !digits(month, 1, 2) || !digits(year, 4, 4)
    {
        return None;
    }
    NaiveDate::parse_from_str(token, PORTAL_DATE_FORMAT).ok()
}

/// Inclusive date check on raw texts; any unparseable input yields `false`.
pub fn in_range(date_text: &str, start_text: &str, end_text: &str) -> bool {
    match (
        parse_portal_date(date_text),
        parse_portal_date(start_text),
        parse_portal_date(end_text),
    ) {
        (Some(date), Some(start), Some(end)) => start <= date && date <= end,
        _ => false,
    }
}

/// Inclusive publication-date window for one crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, CoreError> {
        if start > end {
            return Err(CoreError::InvertedRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, CoreError> {
        let start = parse_input_date(start)?;
        let end = parse_input_date(end)?;
        Self::new(start, end)
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn contains_text(&self, date_text: &str) -> bool {
        parse_portal_date(date_text).is_some_and(|date| self.contains(date))
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} → {}",
            self.start.format(PORTAL_DATE_FORMAT),
            self.end.format(PORTAL_DATE_FORMAT)
        )
    }
}

/// Strict `dd/mm/yyyy` parser for caller-supplied bounds.
pub fn parse_input_date(text: &str) -> Result<NaiveDate, CoreError> {
    parse_date_token(text.trim()).ok_or_else(|| CoreError::InvalidDate(text.to_string()))
}

/// Results-per-page values offered by the portal paginator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageSize {
    Five,
    Ten,
    TwentyFive,
    #[default]
    Hundred,
}

impl PageSize {
    pub const ALL: [PageSize; 4] = [
        PageSize::Five,
        PageSize::Ten,
        PageSize::TwentyFive,
        PageSize::Hundred,
    ];

    pub fn value(self) -> u32 {
        match self {
            PageSize::Five => 5,
            PageSize::Ten => 10,
            PageSize::TwentyFive => 25,
            PageSize::Hundred => 100,
        }
    }

    pub fn from_value(value: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|size| size.value() == value)
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

impl FromStr for PageSize {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .ok()
            .and_then(PageSize::from_value)
            .ok_or_else(|| CoreError::InvalidPageSize(s.to_string()))
    }
}

/// Detail URL → CUBSO mapping produced by the enrichment pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentResult {
    values: BTreeMap<String, String>,
}

impl EnrichmentResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, url: impl Into<String>, value: impl Into<String>) {
        self.values.insert(url.into(), value.into());
    }

    pub fn get(&self, url: &str) -> Option<&str> {
        self.values.get(url).map(String::as_str)
    }

    /// Identifier for `url`, or `not available` when the URL was never visited.
    pub fn identifier_for(&self, url: &str) -> &str {
        self.get(url).unwrap_or(NOT_AVAILABLE)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn found_count(&self) -> usize {
        self.values.values().filter(|v| is_identifier(v)).count()
    }

    pub fn error_count(&self) -> usize {
        self.values.values().filter(|v| v.as_str() == ERROR).count()
    }
}

/// True for a real identifier value, false for sentinels and blanks.
pub fn is_identifier(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty() && value != NOT_AVAILABLE && value != ERROR
}

pub const SECTOR_INFRASTRUCTURE: &str = "INFRASTRUCTURE/WORK";
pub const SECTOR_SERVICES: &str = "SERVICES/CONSULTING";
pub const SECTOR_GOODS: &str = "GOODS";
pub const SECTOR_TECHNOLOGY: &str = "TECHNOLOGY";
pub const SECTOR_OTHER: &str = "OTHER";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorRule {
    pub sector: String,
    /// Case-insensitive substrings.
    #[serde(default)]
    pub contains_any: Vec<String>,
    /// Case-insensitive whole words.
    #[serde(default)]
    pub words_any: Vec<String>,
}

impl SectorRule {
    fn new(sector: &str, contains_any: &[&str], words_any: &[&str]) -> Self {
        Self {
            sector: sector.to_string(),
            contains_any: contains_any.iter().map(|s| s.to_string()).collect(),
            words_any: words_any.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn matches(&self, lowered: &str, words: &[&str]) -> bool {
        self.contains_any
            .iter()
            .any(|needle| lowered.contains(&needle.to_lowercase()))
            || self
                .words_any
                .iter()
                .any(|word| words.contains(&word.to_lowercase().as_str()))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SectorRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<SectorRule>,
    #[serde(default)]
    fallback: Option<String>,
}

/// Ordered keyword rules; the first matching rule decides the sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorRules {
    rules: Vec<SectorRule>,
    fallback: String,
}

impl Default for SectorRules {
    fn default() -> Self {
        Self {
            rules: vec![
                SectorRule::new(
                    SECTOR_INFRASTRUCTURE,
                    &[
                        "obra",
                        "construcc",
                        "vial",
                        "edificación",
                        "edificacion",
                        "infraestructura",
                        "construction",
                        "infrastructure",
                    ],
                    &[],
                ),
                SectorRule::new(
                    SECTOR_SERVICES,
                    &[
                        "servicio",
                        "consultor",
                        "asesor",
                        "mantenimiento",
                        "service",
                        "consulting",
                        "maintenance",
                    ],
                    &[],
                ),
                SectorRule::new(
                    SECTOR_GOODS,
                    &[
                        "bien",
                        "adquisic",
                        "equipo",
                        "material",
                        "suministro",
                        "goods",
                        "acquisition",
                        "equipment",
                        "supply",
                    ],
                    &[],
                ),
                SectorRule::new(
                    SECTOR_TECHNOLOGY,
                    &[
                        "software",
                        "sistema",
                        "tecnología",
                        "tecnologia",
                        "informática",
                        "informatica",
                        "technology",
                    ],
                    &["ti", "it"],
                ),
            ],
            fallback: SECTOR_OTHER.to_string(),
        }
    }
}

impl SectorRules {
    pub fn new(rules: Vec<SectorRule>, fallback: impl Into<String>) -> Self {
        Self {
            rules,
            fallback: fallback.into(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, CoreError> {
        let file: SectorRulesFile =
            serde_yaml::from_str(text).map_err(|e| CoreError::InvalidRules(e.to_string()))?;
        if file.rules.iter().any(|r| r.sector.trim().is_empty()) {
            return Err(CoreError::InvalidRules("rule with empty sector".to_string()));
        }
        Ok(Self {
            rules: file.rules,
            fallback: file.fallback.unwrap_or_else(|| SECTOR_OTHER.to_string()),
        })
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::InvalidRules(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    pub fn rules(&self) -> &[SectorRule] {
        &self.rules
    }

    pub fn classify(&self, description: &str) -> &str {
        let lowered = description.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        self.rules
            .iter()
            .find(|rule| rule.matches(&lowered, &words))
            .map(|rule| rule.sector.as_str())
            .unwrap_or(self.fallback.as_str())
    }
}

/// Classify a description with the built-in rule table.
pub fn classify_sector(description: &str) -> String {
    SectorRules::default().classify(description).to_string()
}

/// Keyword and object-type filter applied before export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenderFilter {
    pub keyword: Option<String>,
    pub object_types: Vec<String>,
}

impl TenderFilter {
    pub fn is_empty(&self) -> bool {
        self.keyword.as_deref().map_or(true, |k| k.trim().is_empty())
            && self.object_types.iter().all(|t| t.trim().is_empty())
    }

    pub fn matches(&self, record: &TenderRecord) -> bool {
        if let Some(keyword) = self.keyword.as_deref().map(str::trim) {
            if !keyword.is_empty() {
                let needle = keyword.to_lowercase();
                let hit = [&record.process_code, &record.entity, &record.description]
                    .iter()
                    .any(|field| field.to_lowercase().contains(&needle));
                if !hit {
                    return false;
                }
            }
        }

        let types: Vec<String> = self
            .object_types
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if types.is_empty() {
            return true;
        }
        let description = record.description.to_lowercase();
        types.iter().any(|t| description.contains(t.as_str()))
    }

    pub fn apply(&self, records: Vec<TenderRecord>) -> Vec<TenderRecord> {
        if self.is_empty() {
            return records;
        }
        records.into_iter().filter(|r| self.matches(r)).collect()
    }
}

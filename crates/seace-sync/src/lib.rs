//! Crawl, enrich, classify and export pipeline for SEACE tenders.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use seace_adapters::{DetailLayout, SEACE_URL};
use seace_core::{EnrichmentResult, SectorRules, TenderFilter, TenderRecord, NOT_AVAILABLE};
use seace_storage::{BrowserSessionConfig, DetailBrowser, DiagnosticStore, ListingDriver};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

mod crawler;
mod enricher;
#[cfg(test)]
mod test_support;

pub use crawler::{CrawlConfig, CrawlOutcome, CrawlRequest, CrawlTimings, ListingCrawler};
pub use enricher::{DetailEnricher, EnrichConfig, DEFAULT_CONCURRENCY};

pub const CRATE_NAME: &str = "seace-sync";

pub const DEFAULT_OUTPUT: &str = "seace_tenders.csv";

pub const CSV_HEADERS: [&str; 9] = [
    "Process Code",
    "Entity",
    "Description",
    "Status",
    "Publication Date",
    "Quotation Dates",
    "Detail URL",
    "CUBSO",
    "Sector",
];

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub portal_url: String,
    pub output_path: PathBuf,
    pub diagnostics_dir: PathBuf,
    pub user_agent: Option<String>,
    pub navigation_timeout_secs: u64,
    pub headless: bool,
    pub concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            portal_url: lookup("SEACE_URL").unwrap_or_else(|| SEACE_URL.to_string()),
            output_path: lookup("SEACE_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT)),
            diagnostics_dir: lookup("SEACE_DIAGNOSTICS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./diagnostics")),
            user_agent: lookup("SEACE_USER_AGENT").filter(|v| !v.trim().is_empty()),
            navigation_timeout_secs: lookup("SEACE_NAV_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(60),
            headless: lookup("SEACE_HEADLESS")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False" | "no"))
                .unwrap_or(true),
            concurrency: lookup("SEACE_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_CONCURRENCY),
        }
    }

    pub fn session_config(&self) -> BrowserSessionConfig {
        let defaults = BrowserSessionConfig::default();
        BrowserSessionConfig {
            headless: self.headless,
            user_agent: self.user_agent.clone().or(defaults.user_agent),
            navigation_timeout: Duration::from_secs(self.navigation_timeout_secs),
            ..defaults
        }
    }

    pub fn crawl_config(&self) -> CrawlConfig {
        CrawlConfig {
            portal_url: self.portal_url.clone(),
            ..CrawlConfig::default()
        }
    }

    pub fn enrich_config(&self) -> EnrichConfig {
        EnrichConfig {
            concurrency: self.concurrency,
            ..EnrichConfig::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub crawl: CrawlRequest,
    pub filter: TenderFilter,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_processed: u32,
    pub total_extracted: usize,
    pub in_range: usize,
    pub detail_urls: usize,
    pub identifiers_found: usize,
    pub enrichment_errors: usize,
    pub exported_rows: usize,
    pub output_path: Option<String>,
}

/// Distinct non-empty detail URLs in first-seen order.
pub fn detail_urls(records: &[TenderRecord]) -> Vec<String> {
    let mut seen = HashSet::new();
    records
        .iter()
        .map(|record| record.detail_url.trim())
        .filter(|url| !url.is_empty() && seen.insert(*url))
        .map(str::to_string)
        .collect()
}

/// Attach the CUBSO looked up for each record's detail URL and its sector.
pub fn merge_enrichment(
    records: Vec<TenderRecord>,
    enrichment: &EnrichmentResult,
    rules: &SectorRules,
) -> Vec<TenderRecord> {
    records
        .into_iter()
        .map(|mut record| {
            let url = record.detail_url.trim();
            record.cubso = if url.is_empty() {
                NOT_AVAILABLE.to_string()
            } else {
                enrichment.identifier_for(url).to_string()
            };
            record.sector = rules.classify(&record.description).to_string();
            record
        })
        .collect()
}

fn csv_row(record: &TenderRecord) -> [&str; 9] {
    [
        record.process_code.as_str(),
        record.entity.as_str(),
        record.description.as_str(),
        record.status.as_str(),
        record.publication_date.as_str(),
        record.quotation_dates.as_str(),
        record.detail_url.as_str(),
        record.cubso.as_str(),
        record.sector.as_str(),
    ]
}

/// UTF-8 with a byte order mark, one header row, one row per record.
pub fn write_csv<W: Write>(mut writer: W, records: &[TenderRecord]) -> Result<()> {
    writer
        .write_all(UTF8_BOM)
        .context("writing byte order mark")?;
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(CSV_HEADERS).context("writing csv header")?;
    for record in records {
        csv.write_record(csv_row(record))
            .with_context(|| format!("writing csv row for {}", record.process_code))?;
    }
    csv.flush().context("flushing csv output")?;
    Ok(())
}

pub fn export_csv(path: &Path, records: &[TenderRecord]) -> Result<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating output directory {}", parent.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("creating output file {}", path.display()))?;
    write_csv(BufWriter::new(file), records)
        .with_context(|| format!("exporting {}", path.display()))?;
    Ok(records.len())
}

pub struct Pipeline {
    config: PipelineConfig,
    rules: SectorRules,
    crawler: ListingCrawler,
    enricher: DetailEnricher,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, rules: SectorRules) -> Result<Self> {
        let crawler = ListingCrawler::new(
            config.crawl_config(),
            DiagnosticStore::new(&config.diagnostics_dir),
        )
        .context("building listing crawler")?;
        let enricher = DetailEnricher::new(config.enrich_config(), DetailLayout::default())
            .context("building detail enricher")?;
        Ok(Self::from_parts(config, rules, crawler, enricher))
    }

    pub fn from_parts(
        config: PipelineConfig,
        rules: SectorRules,
        crawler: ListingCrawler,
        enricher: DetailEnricher,
    ) -> Self {
        Self {
            config,
            rules,
            crawler,
            enricher,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn enricher(&self) -> &DetailEnricher {
        &self.enricher
    }

    /// One full run against live chromium sessions.
    pub async fn run_once(&self, request: &RunRequest) -> Result<PipelineSummary> {
        let run_id = Uuid::new_v4();
        let session = self.config.session_config();
        async {
            let started_at = Utc::now();
            info!(range = %request.crawl.range, "pipeline run started");
            let crawl = self
                .crawler
                .crawl_with_chromium(&session, &request.crawl)
                .await;
            let urls = detail_urls(&crawl.records);
            let enrichment = self.enricher.enrich_with_chromium(&session, &urls).await;
            self.finish(run_id, started_at, request, crawl, &enrichment)
        }
        .instrument(info_span!("pipeline_run", %run_id))
        .await
    }

    /// One full run over caller-provided sessions. The listing driver is closed by the
    /// crawl; the detail browser stays with the caller.
    pub async fn run_with<D, B>(
        &self,
        driver: &mut D,
        browser: &B,
        request: &RunRequest,
    ) -> Result<PipelineSummary>
    where
        D: ListingDriver + ?Sized,
        B: DetailBrowser + ?Sized,
    {
        let run_id = Uuid::new_v4();
        async {
            let started_at = Utc::now();
            let crawl = self.crawler.crawl(driver, &request.crawl).await;
            let urls = detail_urls(&crawl.records);
            let enrichment = if urls.is_empty() {
                EnrichmentResult::new()
            } else {
                self.enricher.enrich(browser, &urls).await
            };
            self.finish(run_id, started_at, request, crawl, &enrichment)
        }
        .instrument(info_span!("pipeline_run", %run_id))
        .await
    }

    fn finish(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        request: &RunRequest,
        crawl: CrawlOutcome,
        enrichment: &EnrichmentResult,
    ) -> Result<PipelineSummary> {
        let mut summary = PipelineSummary {
            run_id,
            started_at,
            finished_at: started_at,
            pages_processed: crawl.pages_processed,
            total_extracted: crawl.total_extracted,
            in_range: crawl.records.len(),
            detail_urls: enrichment.len(),
            identifiers_found: enrichment.found_count(),
            enrichment_errors: enrichment.error_count(),
            exported_rows: 0,
            output_path: None,
        };

        if crawl.records.is_empty() {
            warn!(range = %request.crawl.range, "no tenders in range, nothing exported");
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        let merged = merge_enrichment(crawl.records, enrichment, &self.rules);
        let rows = request.filter.apply(merged);
        if rows.len() < summary.in_range {
            info!(
                kept = rows.len(),
                dropped = summary.in_range - rows.len(),
                "filter applied"
            );
        }

        let path = &self.config.output_path;
        summary.exported_rows = export_csv(path, &rows)?;
        summary.output_path = Some(path.display().to_string());
        summary.finished_at = Utc::now();
        info!(
            rows = summary.exported_rows,
            path = %path.display(),
            found = summary.identifiers_found,
            errors = summary.enrichment_errors,
            "results exported"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        card, empty_listing, instant_timings, listing, DetailPage, FakeDetailBrowser, FakeListing,
    };
    use seace_core::{
        DateRange, PageSize, ERROR, SECTOR_GOODS, SECTOR_INFRASTRUCTURE, SECTOR_SERVICES,
    };
    use tempfile::TempDir;

    fn record(code: &str, description: &str, url: &str) -> TenderRecord {
        TenderRecord {
            process_code: code.to_string(),
            description: description.to_string(),
            detail_url: url.to_string(),
            ..TenderRecord::default()
        }
    }

    fn csv_text(records: &[TenderRecord]) -> String {
        let mut out = Vec::new();
        write_csv(&mut out, records).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn pipeline(dir: &TempDir) -> Pipeline {
        let config = PipelineConfig {
            output_path: dir.path().join("out").join("tenders.csv"),
            diagnostics_dir: dir.path().join("diagnostics"),
            ..PipelineConfig::default()
        };
        let crawler = ListingCrawler::new(
            CrawlConfig {
                timings: instant_timings(),
                ..config.crawl_config()
            },
            DiagnosticStore::new(&config.diagnostics_dir),
        )
        .unwrap();
        let enricher = DetailEnricher::new(
            EnrichConfig {
                batch_pause: Duration::ZERO,
                cell_timeout: Duration::ZERO,
                ..config.enrich_config()
            },
            DetailLayout::default(),
        )
        .unwrap();
        Pipeline::from_parts(config, SectorRules::default(), crawler, enricher)
    }

    fn march(filter: TenderFilter) -> RunRequest {
        RunRequest {
            crawl: CrawlRequest {
                range: DateRange::parse("01/03/2025", "31/03/2025").unwrap(),
                max_pages: 3,
                page_size: PageSize::Hundred,
            },
            filter,
        }
    }

    #[test]
    fn detail_urls_are_distinct_and_non_empty() {
        let records = vec![
            record("A", "x", "https://seace/1"),
            record("B", "x", ""),
            record("C", "x", "https://seace/2"),
            record("D", "x", " https://seace/1 "),
        ];
        assert_eq!(detail_urls(&records), vec!["https://seace/1", "https://seace/2"]);
    }

    #[test]
    fn merge_sets_cubso_and_sector() {
        let mut enrichment = EnrichmentResult::new();
        enrichment.insert("https://seace/1", "7213154100001");
        enrichment.insert("https://seace/2", ERROR);

        let merged = merge_enrichment(
            vec![
                record("A", "Obra: mejoramiento de pista", "https://seace/1"),
                record("B", "Servicio de limpieza", "https://seace/2"),
                record("C", "Bien: papel bond", ""),
                record("D", "Bien: tóner", "https://seace/3"),
            ],
            &enrichment,
            &SectorRules::default(),
        );

        assert_eq!(merged[0].cubso, "7213154100001");
        assert_eq!(merged[0].sector, SECTOR_INFRASTRUCTURE);
        assert_eq!(merged[1].cubso, ERROR);
        assert_eq!(merged[1].sector, SECTOR_SERVICES);
        assert_eq!(merged[2].cubso, NOT_AVAILABLE);
        assert_eq!(merged[2].sector, SECTOR_GOODS);
        assert_eq!(merged[3].cubso, NOT_AVAILABLE);
    }

    #[test]
    fn csv_starts_with_bom_and_header() {
        let text = csv_text(&[record("AS-1-2025", "Servicio: limpieza, poda", "")]);

        assert!(text.starts_with('\u{feff}'));
        let mut lines = text.trim_start_matches('\u{feff}').lines();
        assert_eq!(
            lines.next(),
            Some("Process Code,Entity,Description,Status,Publication Date,Quotation Dates,Detail URL,CUBSO,Sector")
        );
        assert_eq!(
            lines.next(),
            Some("AS-1-2025,not available,\"Servicio: limpieza, poda\",not available,not available,not available,,not available,")
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn export_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("out.csv");

        let rows = export_csv(&path, &[record("A", "x", ""), record("B", "y", "")]).unwrap();

        assert_eq!(rows, 2);
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(UTF8_BOM));
    }

    #[test]
    fn config_defaults_and_overrides() {
        let defaults = PipelineConfig::from_lookup(|_| None);
        assert_eq!(defaults.portal_url, SEACE_URL);
        assert_eq!(defaults.output_path, PathBuf::from(DEFAULT_OUTPUT));
        assert_eq!(defaults.concurrency, DEFAULT_CONCURRENCY);
        assert!(defaults.headless);
        assert_eq!(defaults.session_config().navigation_timeout, Duration::from_secs(60));
        assert!(defaults.session_config().user_agent.is_some());

        let config = PipelineConfig::from_lookup(|key| match key {
            "SEACE_OUTPUT" => Some("/tmp/x.csv".to_string()),
            "SEACE_HEADLESS" => Some("false".to_string()),
            "SEACE_CONCURRENCY" => Some("0".to_string()),
            "SEACE_NAV_TIMEOUT_SECS" => Some("15".to_string()),
            "SEACE_USER_AGENT" => Some("seace-test/1.0".to_string()),
            _ => None,
        });
        assert_eq!(config.output_path, PathBuf::from("/tmp/x.csv"));
        assert!(!config.headless);
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        let session = config.session_config();
        assert_eq!(session.navigation_timeout, Duration::from_secs(15));
        assert_eq!(session.user_agent.as_deref(), Some("seace-test/1.0"));
        assert_eq!(config.enrich_config().concurrency, DEFAULT_CONCURRENCY);
    }

    #[tokio::test]
    async fn run_exports_enriched_and_classified_rows() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        let mut driver = FakeListing::new(vec![
            listing(&[
                card("AS-1-2025", "10/03/2025", "Obra: construcción de pista vial"),
                card("AS-2-2025", "20/02/2025", "Bien: papel bond"),
            ]),
            listing(&[card(
                "AS-3-2025",
                "05/03/2025",
                "Servicio: mantenimiento de parques",
            )]),
        ]);
        let browser = FakeDetailBrowser::new([
            (
                "https://prod6.seace.gob.pe/buscador-publico/contrataciones/AS-1-2025",
                DetailPage::Cell("7213154100001"),
            ),
            (
                "https://prod6.seace.gob.pe/buscador-publico/contrataciones/AS-3-2025",
                DetailPage::Slow,
            ),
        ]);

        let summary = pipeline
            .run_with(&mut driver, &browser, &march(TenderFilter::default()))
            .await
            .unwrap();

        assert_eq!(summary.pages_processed, 2);
        assert_eq!(summary.total_extracted, 3);
        assert_eq!(summary.in_range, 2);
        assert_eq!(summary.detail_urls, 2);
        assert_eq!(summary.identifiers_found, 1);
        assert_eq!(summary.enrichment_errors, 1);
        assert_eq!(summary.exported_rows, 2);
        assert!(driver.closed);

        let text = std::fs::read_to_string(dir.path().join("out").join("tenders.csv")).unwrap();
        let rows: Vec<&str> = text.lines().skip(1).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("AS-1-2025,"));
        assert!(rows[0].ends_with(",7213154100001,INFRASTRUCTURE/WORK"));
        assert!(rows[1].starts_with("AS-3-2025,"));
        assert!(rows[1].ends_with(",Error,SERVICES/CONSULTING"));
    }

    #[tokio::test]
    async fn run_applies_filter_before_export() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        let mut driver = FakeListing::new(vec![listing(&[
            card("AS-1-2025", "10/03/2025", "Obra: mejoramiento de pista"),
            card("AS-2-2025", "11/03/2025", "Servicio: limpieza"),
        ])]);

        let summary = pipeline
            .run_with(
                &mut driver,
                &FakeDetailBrowser::blank(),
                &march(TenderFilter {
                    keyword: Some("LIMPIEZA".to_string()),
                    object_types: Vec::new(),
                }),
            )
            .await
            .unwrap();

        assert_eq!(summary.in_range, 2);
        assert_eq!(summary.exported_rows, 1);
    }

    #[tokio::test]
    async fn empty_crawl_exports_nothing() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        let mut driver = FakeListing::new(vec![empty_listing()]);
        let browser = FakeDetailBrowser::blank();

        let summary = pipeline
            .run_with(&mut driver, &browser, &march(TenderFilter::default()))
            .await
            .unwrap();

        assert_eq!(summary.exported_rows, 0);
        assert!(summary.output_path.is_none());
        assert_eq!(browser.stats.opened(), 0);
        assert!(!dir.path().join("out").join("tenders.csv").exists());
        assert!(dir.path().join("diagnostics").join("debug_page_1.html").exists());
    }
}

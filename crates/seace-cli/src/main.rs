use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::error::ErrorKind;
use clap::{Args, CommandFactory, Parser, Subcommand};
use seace_adapters::DetailLayout;
use seace_core::{parse_input_date, DateRange, PageSize, SectorRules, TenderFilter};
use seace_sync::{CrawlRequest, DetailEnricher, Pipeline, PipelineConfig, RunRequest};
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "seace-cli")]
#[command(about = "SEACE public tender scraper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl the listing, enrich with CUBSO, classify and export CSV.
    Run(RunArgs),
    /// Look up CUBSO identifiers for detail page URLs and print them as JSON.
    Enrich(EnrichArgs),
    /// Print the sector a description falls into.
    Classify {
        text: String,
        #[arg(long)]
        sector_rules: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// First publication date, dd/mm/yyyy.
    #[arg(long, value_parser = parse_date)]
    start: NaiveDate,
    /// Last publication date, dd/mm/yyyy.
    #[arg(long, value_parser = parse_date)]
    end: NaiveDate,
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    max_pages: u32,
    /// One of 5, 10, 25, 100.
    #[arg(long, default_value_t = PageSize::Hundred, value_parser = parse_page_size)]
    page_size: PageSize,
    #[arg(long, env = "SEACE_CONCURRENCY", value_parser = clap::value_parser!(u32).range(1..))]
    concurrency: Option<u32>,
    #[arg(long, env = "SEACE_OUTPUT")]
    output: Option<PathBuf>,
    /// Keep only tenders mentioning this text in code, entity or description.
    #[arg(long)]
    keyword: Option<String>,
    /// Keep only tenders whose description mentions one of these object types.
    #[arg(long = "object-type")]
    object_types: Vec<String>,
    /// YAML sector rules replacing the built-in table.
    #[arg(long)]
    sector_rules: Option<PathBuf>,
    /// Show the browser window.
    #[arg(long)]
    headful: bool,
}

#[derive(Debug, Args)]
struct EnrichArgs {
    #[arg(required = true)]
    urls: Vec<String>,
    #[arg(long, env = "SEACE_CONCURRENCY", value_parser = clap::value_parser!(u32).range(1..))]
    concurrency: Option<u32>,
    #[arg(long)]
    headful: bool,
}

fn parse_date(value: &str) -> Result<NaiveDate, String> {
    parse_input_date(value).map_err(|err| err.to_string())
}

fn parse_page_size(value: &str) -> Result<PageSize, String> {
    value.parse::<PageSize>().map_err(|err| err.to_string())
}

fn load_rules(path: Option<&Path>) -> Result<SectorRules> {
    match path {
        Some(path) => SectorRules::from_yaml_file(path)
            .with_context(|| format!("loading sector rules from {}", path.display())),
        None => Ok(SectorRules::default()),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .init();
}

async fn run(args: RunArgs) -> Result<()> {
    let range = match DateRange::new(args.start, args.end) {
        Ok(range) => range,
        Err(err) => Cli::command().error(ErrorKind::ValueValidation, err).exit(),
    };

    let mut config = PipelineConfig::from_env();
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency as usize;
    }
    if let Some(output) = args.output {
        config.output_path = output;
    }
    if args.headful {
        config.headless = false;
    }
    let rules = load_rules(args.sector_rules.as_deref())?;

    info!(
        %range,
        max_pages = args.max_pages,
        page_size = %args.page_size,
        concurrency = config.concurrency,
        "starting run"
    );
    let pipeline = Pipeline::new(config, rules)?;
    let summary = pipeline
        .run_once(&RunRequest {
            crawl: CrawlRequest {
                range,
                max_pages: args.max_pages,
                page_size: args.page_size,
            },
            filter: TenderFilter {
                keyword: args.keyword,
                object_types: args.object_types,
            },
        })
        .await?;

    match &summary.output_path {
        Some(path) => println!(
            "run complete: run_id={} pages={} extracted={} in_range={} cubso_found={} errors={} exported={} output={}",
            summary.run_id,
            summary.pages_processed,
            summary.total_extracted,
            summary.in_range,
            summary.identifiers_found,
            summary.enrichment_errors,
            summary.exported_rows,
            path
        ),
        None => println!(
            "run complete: run_id={} pages={} extracted={} no tenders in range, nothing exported",
            summary.run_id, summary.pages_processed, summary.total_extracted
        ),
    }
    Ok(())
}

async fn enrich(args: EnrichArgs) -> Result<()> {
    let mut config = PipelineConfig::from_env();
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency as usize;
    }
    if args.headful {
        config.headless = false;
    }

    let enricher = DetailEnricher::new(config.enrich_config(), DetailLayout::default())
        .context("building detail enricher")?;
    let result = enricher
        .enrich_with_chromium(&config.session_config(), &args.urls)
        .await;
    let mapping: BTreeMap<&str, &str> = result.iter().collect();
    println!("{}", serde_json::to_string_pretty(&mapping)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await?,
        Commands::Enrich(args) => enrich(args).await?,
        Commands::Classify { text, sector_rules } => {
            let rules = load_rules(sector_rules.as_deref())?;
            println!("{}", rules.classify(&text));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_arguments_use_defaults() {
        let cli = Cli::try_parse_from([
            "seace-cli",
            "run",
            "--start",
            "01/03/2025",
            "--end",
            "31/03/2025",
            "--object-type",
            "servicio",
            "--object-type",
            "obra",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.start, NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
        assert_eq!(args.max_pages, 10);
        assert_eq!(args.page_size, PageSize::Hundred);
        assert_eq!(args.object_types, vec!["servicio", "obra"]);
        assert!(!args.headful);
    }

    #[test]
    fn rejects_malformed_dates() {
        let err = Cli::try_parse_from([
            "seace-cli",
            "run",
            "--start",
            "2025-03-01",
            "--end",
            "31/03/2025",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn rejects_unsupported_page_size_and_zero_pages() {
        let base = ["seace-cli", "run", "--start", "01/03/2025", "--end", "31/03/2025"];

        let page_size = Cli::try_parse_from(base.iter().copied().chain(["--page-size", "50"]));
        assert!(page_size.is_err());

        let pages = Cli::try_parse_from(base.iter().copied().chain(["--max-pages", "0"]));
        assert!(pages.is_err());

        let ok = Cli::try_parse_from(base.iter().copied().chain(["--page-size", "25"])).unwrap();
        let Commands::Run(args) = ok.command else {
            panic!("expected run command");
        };
        assert_eq!(args.page_size, PageSize::TwentyFive);
    }

    #[test]
    fn enrich_requires_urls() {
        assert!(Cli::try_parse_from(["seace-cli", "enrich"]).is_err());
        let cli = Cli::try_parse_from(["seace-cli", "enrich", "https://seace/1"]).unwrap();
        assert!(matches!(cli.command, Commands::Enrich(ref args) if args.urls.len() == 1));
    }

    #[test]
    fn classify_uses_default_rules() {
        let rules = load_rules(None).unwrap();
        assert_eq!(rules.classify("Servicio de consultoría"), "SERVICES/CONSULTING");
    }
}

//! Diagnostic markup storage + browser session plumbing for the SEACE pipeline.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

mod browser;

pub use browser::{
    blocks_resource, BrowserError, BrowserSessionConfig, ChromiumDetailBrowser,
    ChromiumDetailTab, ChromiumListingDriver, ControlState, DetailBrowser, DetailTab,
    ListingDriver, Locator, ScrollPosition,
};

pub const CRATE_NAME: &str = "seace-storage";

/// Dump name used when the results container never shows up after load.
pub const INITIAL_LOAD_DUMP: &str = "debug_initial_load.html";

pub fn page_dump_name(page_no: u32) -> String {
    format!("debug_page_{page_no}.html")
}

#[derive(Debug, Clone)]
pub struct StoredDump {
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Directory of raw markup dumps written when structural extraction fails.
#[derive(Debug, Clone)]
pub struct DiagnosticStore {
    root: PathBuf,
}

impl DiagnosticStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `markup` under `name` via temp file + rename; an existing dump is replaced.
    pub async fn write_markup(&self, name: &str, markup: &str) -> anyhow::Result<StoredDump> {
        let relative_path = PathBuf::from(sanitize_dump_name(name));
        let absolute_path = self.root.join(&relative_path);
        let bytes = markup.as_bytes();

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating diagnostics directory {}", self.root.display()))?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp dump file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp dump file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp dump file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp dump {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        debug!(path = %absolute_path.display(), bytes = bytes.len(), "stored markup dump");
        Ok(StoredDump {
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
        })
    }
}

fn sanitize_dump_name(name: &str) -> String {
    let cleaned = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "debug_dump.html".to_string()
    } else {
        cleaned.to_string()
    }
}

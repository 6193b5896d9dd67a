//! Run records - last successful price drop per retainer

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info};

/// Durable log of completed runs
pub trait RunRecordSink: Send + Sync {
    fn record_completion(&self, target: &str, at: DateTime<Utc>) -> anyhow::Result<()>;

    fn last_completion(&self, target: &str) -> Option<DateTime<Utc>>;
}

/// In-memory records
#[derive(Debug, Default)]
pub struct MemoryRunRecords {
    records: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryRunRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of targets with a record
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RunRecordSink for MemoryRunRecords {
    fn record_completion(&self, target: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("Run record lock poisoned"))?;
        records.insert(target.to_string(), at);
        Ok(())
    }

    fn last_completion(&self, target: &str) -> Option<DateTime<Utc>> {
        self.records.lock().ok()?.get(target).copied()
    }
}

/// Records persisted as a JSON object of target name to RFC 3339 timestamp
#[derive(Debug)]
pub struct JsonRunRecordStore {
    path: PathBuf,
    records: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl JsonRunRecordStore {
    /// Open the store, starting empty if the file is missing or unreadable
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match Self::load(&path) {
            Ok(records) => {
                debug!("Loaded {} run records from {}", records.len(), path.display());
                records
            }
            Err(e) => {
                error!("Failed to load run records: {:#}", e);
                HashMap::new()
            }
        };

        Self {
            path,
            records: Mutex::new(records),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> anyhow::Result<HashMap<String, DateTime<Utc>>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let records = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(records)
    }

    /// Write to a sibling temp file, then rename over the target
    fn save(&self, records: &HashMap<String, DateTime<Utc>>) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
        }

        let content =
            serde_json::to_string_pretty(records).context("Failed to serialize run records")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        debug!("Wrote {}", self.path.display());
        Ok(())
    }
}

impl RunRecordSink for JsonRunRecordStore {
    fn record_completion(&self, target: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("Run record lock poisoned"))?;
        let mut updated = records.clone();
        updated.insert(target.to_string(), at);
        self.save(&updated)?;
        *records = updated;
        info!("Recorded price drop for {} at {}", target, at.to_rfc3339());
        Ok(())
    }

    fn last_completion(&self, target: &str) -> Option<DateTime<Utc>> {
        self.records.lock().ok()?.get(target).copied()
    }
}

/// Whether a target may be run again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Available,
    /// Nothing listed on the market
    NoItems,
    CoolingDown {
        remaining: Duration,
        available_at: DateTime<Utc>,
    },
}

impl Eligibility {
    pub fn is_available(&self) -> bool {
        matches!(self, Eligibility::Available)
    }

    /// Short text for status displays
    pub fn describe(&self) -> String {
        match self {
            Eligibility::Available => "Available Now".to_string(),
            Eligibility::NoItems => "No items".to_string(),
            Eligibility::CoolingDown { remaining, .. } => {
                format!("Available in {}", format_remaining(*remaining))
            }
        }
    }
}

/// Cooldown state of a target given its last completion
pub fn eligibility(
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown: Duration,
    item_count: usize,
) -> Eligibility {
    if item_count == 0 {
        return Eligibility::NoItems;
    }
    let Some(last) = last else {
        return Eligibility::Available;
    };

    let available_at = last + cooldown;
    let remaining = available_at - now;
    if remaining <= Duration::zero() {
        Eligibility::Available
    } else {
        Eligibility::CoolingDown {
            remaining,
            available_at,
        }
    }
}

/// `HH:MM:SS`, hours not wrapped at 24
pub fn format_remaining(remaining: Duration) -> String {
    let total = remaining.num_seconds().max(0);
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

//! Price Drop Configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Environment prefix for overrides, e.g. `PRICE_DROP__UNDERCUT_AMOUNT=50`
pub const ENV_PREFIX: &str = "PRICE_DROP";

/// Automation settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Settings {
    /// Amount subtracted from the lowest competing price
    #[serde(default = "default_undercut_amount")]
    pub undercut_amount: u32,
    /// Minimum spacing between two controller actions
    #[serde(default = "default_action_delay_ms")]
    pub action_delay_ms: u64,
    /// Period of the tick driver
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Hard cap on items handled in one run
    #[serde(default = "default_max_items_per_run")]
    pub max_items_per_run: usize,
    /// Hours a target stays on cooldown after a successful run
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: i64,
    /// How many times opening the price editor is re-attempted per item
    #[serde(default = "default_max_open_retries")]
    pub max_open_retries: u32,
    /// Index of the "sell items" entry in the retainer menu
    #[serde(default = "default_sell_option_index")]
    pub sell_option_index: i64,
    /// Verbose logging
    #[serde(default)]
    pub debug_mode: bool,
    /// Run record file (defaults to the user config directory)
    #[serde(default)]
    pub records_path: Option<PathBuf>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            undercut_amount: default_undercut_amount(),
            action_delay_ms: default_action_delay_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            max_items_per_run: default_max_items_per_run(),
            cooldown_hours: default_cooldown_hours(),
            max_open_retries: default_max_open_retries(),
            sell_option_index: default_sell_option_index(),
            debug_mode: false,
            records_path: None,
            timeouts: TimeoutConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from an optional file plus `PRICE_DROP__*` environment overrides.
    ///
    /// Missing keys fall back to their defaults, so an empty source yields
    /// `Settings::default()`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build settings")?
            .try_deserialize::<Settings>()
            .context("Failed to deserialize settings")?;

        Ok(settings)
    }

    pub fn action_delay(&self) -> Duration {
        Duration::from_millis(self.action_delay_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cooldown_hours)
    }

    /// Resolved path of the run record file
    pub fn records_file(&self) -> PathBuf {
        self.records_path.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("price-drop")
                .join("retainer_timestamps.json")
        })
    }
}

/// Bounded waits used by the controller
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct TimeoutConfig {
    /// Dialogue and menu transitions
    #[serde(default = "default_menu_ms")]
    pub menu_ms: u64,
    /// Sell list opening
    #[serde(default = "default_list_ms")]
    pub list_ms: u64,
    #[serde(default = "default_context_menu_ms")]
    pub context_menu_ms: u64,
    /// Price editor opening
    #[serde(default = "default_editor_ms")]
    pub editor_ms: u64,
    /// Waiting for a correlated listing batch
    #[serde(default = "default_quote_ms")]
    pub quote_ms: u64,
    #[serde(default = "default_close_list_ms")]
    pub close_list_ms: u64,
    /// Grace period for the dialogue that follows "quit"
    #[serde(default = "default_dismissal_grace_ms")]
    pub dismissal_grace_ms: u64,
    /// Final return to the retainer list
    #[serde(default = "default_return_ms")]
    pub return_ms: u64,
    /// Time the menu must have been open before an option is picked
    #[serde(default = "default_menu_settle_ms")]
    pub menu_settle_ms: u64,
    /// Upper bound for states without a dedicated timeout
    #[serde(default = "default_stall_ms")]
    pub stall_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            menu_ms: default_menu_ms(),
            list_ms: default_list_ms(),
            context_menu_ms: default_context_menu_ms(),
            editor_ms: default_editor_ms(),
            quote_ms: default_quote_ms(),
            close_list_ms: default_close_list_ms(),
            dismissal_grace_ms: default_dismissal_grace_ms(),
            return_ms: default_return_ms(),
            menu_settle_ms: default_menu_settle_ms(),
            stall_ms: default_stall_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn menu(&self) -> Duration {
        Duration::from_millis(self.menu_ms)
    }

    pub fn list(&self) -> Duration {
        Duration::from_millis(self.list_ms)
    }

    pub fn context_menu(&self) -> Duration {
        Duration::from_millis(self.context_menu_ms)
    }

    pub fn editor(&self) -> Duration {
        Duration::from_millis(self.editor_ms)
    }

    pub fn quote(&self) -> Duration {
        Duration::from_millis(self.quote_ms)
    }

    pub fn close_list(&self) -> Duration {
        Duration::from_millis(self.close_list_ms)
    }

    pub fn dismissal_grace(&self) -> Duration {
        Duration::from_millis(self.dismissal_grace_ms)
    }

    pub fn return_to_origin(&self) -> Duration {
        Duration::from_millis(self.return_ms)
    }

    pub fn menu_settle(&self) -> Duration {
        Duration::from_millis(self.menu_settle_ms)
    }

    pub fn stall(&self) -> Duration {
        Duration::from_millis(self.stall_ms)
    }
}

/// Duplicate suppression windows for the listing monitor
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct MonitorConfig {
    #[serde(default = "default_item_window_ms")]
    pub item_window_ms: u64,
    #[serde(default = "default_copy_window_ms")]
    pub copy_window_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            item_window_ms: default_item_window_ms(),
            copy_window_ms: default_copy_window_ms(),
        }
    }
}

impl MonitorConfig {
    pub fn item_window(&self) -> Duration {
        Duration::from_millis(self.item_window_ms)
    }

    pub fn copy_window(&self) -> Duration {
        Duration::from_millis(self.copy_window_ms)
    }
}

fn default_undercut_amount() -> u32 { 1 }
fn default_action_delay_ms() -> u64 { 200 }
fn default_tick_interval_ms() -> u64 { 50 }
fn default_max_items_per_run() -> usize { 20 }
fn default_cooldown_hours() -> i64 { 18 }
fn default_max_open_retries() -> u32 { 1 }
fn default_sell_option_index() -> i64 { 2 }

fn default_menu_ms() -> u64 { 1500 }
fn default_list_ms() -> u64 { 3000 }
fn default_context_menu_ms() -> u64 { 2000 }
fn default_editor_ms() -> u64 { 3000 }
fn default_quote_ms() -> u64 { 3000 }
fn default_close_list_ms() -> u64 { 2000 }
fn default_dismissal_grace_ms() -> u64 { 500 }
fn default_return_ms() -> u64 { 10_000 }
fn default_menu_settle_ms() -> u64 { 250 }
fn default_stall_ms() -> u64 { 10_000 }

fn default_item_window_ms() -> u64 { 3000 }
fn default_copy_window_ms() -> u64 { 1000 }

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_observed_constants() {
        let settings = Settings::default();
        assert_eq!(settings.action_delay(), Duration::from_millis(200));
        assert_eq!(settings.max_items_per_run, 20);
        assert_eq!(settings.cooldown(), chrono::Duration::hours(18));
        assert_eq!(settings.timeouts.menu(), Duration::from_millis(1500));
        assert_eq!(settings.timeouts.return_to_origin(), Duration::from_secs(10));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{ "undercut_amount": 50, "timeouts": {{ "quote_ms": 5000 }} }}"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.undercut_amount, 50);
        assert_eq!(settings.timeouts.quote_ms, 5000);
        // Untouched keys keep defaults
        assert_eq!(settings.timeouts.menu_ms, 1500);
        assert_eq!(settings.max_items_per_run, 20);
    }

    #[test]
    fn test_records_file_override() {
        let settings = Settings {
            records_path: Some(PathBuf::from("/tmp/records.json")),
            ..Settings::default()
        };
        assert_eq!(settings.records_file(), PathBuf::from("/tmp/records.json"));
    }
}

//! Listing Monitor - suggested price for manually opened price editors
//!
//! Runs alongside (not inside) the controller. Whenever the price editor is
//! open and market data arrives, the undercut price is handed to a sink.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::Settings;
use crate::pricing::{self, OwnIdentities, ProcessedGuard, QualityTier, SellingContext};
use crate::quote::Listing;
use crate::surface::IdentitySource;

/// Receives suggested prices
pub trait PriceSink: Send + Sync {
    fn publish(&self, item: &str, price: u32) -> anyhow::Result<()>;
}

/// What the monitor did with a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// No price editor open
    NoEditor,
    /// Same item handled moments ago
    Duplicate,
    NoData,
    Published { item: String, price: u32 },
    SinkFailed,
}

#[derive(Debug, Clone)]
struct OpenEditor {
    label: String,
    tier: QualityTier,
}

pub struct ListingMonitor {
    undercut_amount: u32,
    identities: Arc<dyn IdentitySource>,
    sink: Arc<dyn PriceSink>,
    clock: Arc<dyn Clock>,
    guard: ProcessedGuard,
    editor: Option<OpenEditor>,
}

impl ListingMonitor {
    pub fn new(
        settings: &Settings,
        identities: Arc<dyn IdentitySource>,
        sink: Arc<dyn PriceSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            undercut_amount: settings.undercut_amount,
            identities,
            sink,
            clock,
            guard: ProcessedGuard::new(
                settings.monitor.item_window(),
                settings.monitor.copy_window(),
            ),
            editor: None,
        }
    }

    pub fn on_editor_opened(&mut self, label: &str) {
        if let Some(previous) = self.editor.take() {
            if previous.label != label {
                self.guard.forget(&previous.label);
            }
        }
        let tier = QualityTier::from_label(label);
        debug!("Price editor opened for {} item: {}", tier.short(), label);
        self.editor = Some(OpenEditor {
            label: label.to_string(),
            tier,
        });
    }

    pub fn on_editor_closed(&mut self) {
        if let Some(editor) = self.editor.take() {
            self.guard.forget(&editor.label);
        }
    }

    pub fn on_batch(&mut self, listings: &[Listing]) -> MonitorOutcome {
        let Some(editor) = self.editor.clone() else {
            return MonitorOutcome::NoEditor;
        };

        let now = self.clock.now();
        if !self.guard.should_process(&editor.label, now) {
            debug!("Already handled {} recently", editor.label);
            return MonitorOutcome::Duplicate;
        }

        let own = OwnIdentities::from_names(self.identities.own_identities());
        let context = SellingContext { tier: editor.tier };
        let Some(lowest) = pricing::resolve(listings, &context, &own).price() else {
            debug!("No competing listings for {}", editor.label);
            return MonitorOutcome::NoData;
        };

        let price = pricing::undercut(lowest, self.undercut_amount);
        self.guard.mark(&editor.label, now);
        match self.sink.publish(&editor.label, price) {
            Ok(()) => {
                info!(
                    "Suggested price for {} ({}): {} (lowest {})",
                    editor.label,
                    editor.tier.short(),
                    price,
                    lowest
                );
                MonitorOutcome::Published {
                    item: editor.label,
                    price,
                }
            }
            Err(e) => {
                warn!("Failed to publish price for {}: {:#}", editor.label, e);
                MonitorOutcome::SinkFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::surface::{StaticIdentities, PREMIUM_GLYPH};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<(String, u32)>>,
    }

    impl PriceSink for RecordingSink {
        fn publish(&self, item: &str, price: u32) -> anyhow::Result<()> {
            self.published.lock().unwrap().push((item.to_string(), price));
            Ok(())
        }
    }

    fn monitor() -> (ListingMonitor, Arc<RecordingSink>, ManualClock) {
        let settings = Settings {
            undercut_amount: 5,
            ..Settings::default()
        };
        let sink = Arc::new(RecordingSink::default());
        let clock = ManualClock::new();
        let monitor = ListingMonitor::new(
            &settings,
            Arc::new(StaticIdentities(vec!["Mine=Home".to_string()])),
            sink.clone(),
            Arc::new(clock.clone()),
        );
        (monitor, sink, clock)
    }

    #[test]
    fn test_ignores_batches_without_editor() {
        let (mut monitor, sink, _) = monitor();
        assert_eq!(
            monitor.on_batch(&[Listing::new(100, false, "Other")]),
            MonitorOutcome::NoEditor
        );
        assert!(sink.published.lock().unwrap().is_empty());
    }

    #[test]
    fn test_publishes_undercut_excluding_own() {
        let (mut monitor, sink, _) = monitor();
        monitor.on_editor_opened("Iron Ingot");

        let outcome = monitor.on_batch(&[
            Listing::new(50, false, "Mine"),
            Listing::new(100, false, "Other"),
        ]);
        assert_eq!(
            outcome,
            MonitorOutcome::Published {
                item: "Iron Ingot".to_string(),
                price: 95
            }
        );
        assert_eq!(
            sink.published.lock().unwrap().as_slice(),
            &[("Iron Ingot".to_string(), 95)]
        );
    }

    #[test]
    fn test_duplicate_batches_suppressed_until_editor_reopens() {
        let (mut monitor, _, clock) = monitor();
        let listings = [Listing::new(100, false, "Other")];
        monitor.on_editor_opened("Iron Ingot");

        assert!(matches!(monitor.on_batch(&listings), MonitorOutcome::Published { .. }));
        clock.advance(Duration::from_millis(1500));
        assert_eq!(monitor.on_batch(&listings), MonitorOutcome::Duplicate);

        monitor.on_editor_closed();
        monitor.on_editor_opened("Iron Ingot");
        assert!(matches!(monitor.on_batch(&listings), MonitorOutcome::Published { .. }));
    }

    #[test]
    fn test_premium_editor_prefers_premium_listings() {
        let (mut monitor, _, _) = monitor();
        monitor.on_editor_opened(&format!("Iron Ingot {}", PREMIUM_GLYPH));

        let outcome = monitor.on_batch(&[
            Listing::new(100, false, "Other"),
            Listing::new(300, true, "Other"),
        ]);
        assert!(matches!(outcome, MonitorOutcome::Published { price: 295, .. }));
    }

    #[test]
    fn test_only_own_listings_is_no_data() {
        let (mut monitor, sink, _) = monitor();
        monitor.on_editor_opened("Iron Ingot");
        assert_eq!(
            monitor.on_batch(&[Listing::new(100, false, "mine")]),
            MonitorOutcome::NoData
        );
        assert!(sink.published.lock().unwrap().is_empty());
    }
}

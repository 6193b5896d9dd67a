//! Cross-module tests for price-drop

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::clock::{Clock, ManualClock};
use crate::config::Settings;
use crate::controller::{AutomationController, Collaborators, RunEnd, RunTarget};
use crate::pricing::{self, OwnIdentities, QualityTier, SellingContext};
use crate::quote::{quote_channel, CorrelationId, Listing, QuoteCorrelator};
use crate::records::{eligibility, Eligibility, JsonRunRecordStore, RunRecordSink};
use crate::sim::{SimItem, SimScript, SimulatedEnvironment};
use crate::state::AutomationState;

#[test]
fn test_correlated_batch_to_undercut_price() {
    let settings = Settings {
        undercut_amount: 25,
        ..Settings::default()
    };
    let (feed, mut inbox) = quote_channel();
    let mut correlator = QuoteCorrelator::new();
    let request = correlator.issue(Instant::now());

    feed.deliver(CorrelationId(request.id.0 + 1), vec![Listing::new(1, false, "Noise")]);
    feed.deliver(
        request.id,
        vec![
            Listing::new(300, false, "Mine"),
            Listing::new(410, true, "Rival"),
            Listing::new(520, true, "Other"),
        ],
    );

    let own = OwnIdentities::from_names(["Mine=Home"]);
    let context = SellingContext {
        tier: QualityTier::Premium,
    };
    let accepted: Vec<_> = inbox
        .drain()
        .into_iter()
        .filter_map(|batch| correlator.accept(batch).ok())
        .collect();
    assert_eq!(accepted.len(), 1);

    let lowest = pricing::resolve(&accepted[0].listings, &context, &own)
        .price()
        .unwrap();
    assert_eq!(lowest, 410);
    assert_eq!(pricing::undercut(lowest, settings.undercut_amount), 385);
}

#[test]
fn test_completed_run_starts_cooldown_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("retainer_timestamps.json");
    let settings = Settings {
        records_path: Some(path.clone()),
        ..Settings::default()
    };

    let clock = ManualClock::new();
    let (feed, inbox) = quote_channel();
    let env = Arc::new(SimulatedEnvironment::new(
        SimScript::at_retainer_list(
            &["Alice"],
            vec![SimItem::responding(
                "Iron Ingot",
                900,
                vec![Listing::new(800, false, "Rival")],
            )],
        ),
        Arc::new(clock.clone()),
        feed,
    ));
    let records = Arc::new(JsonRunRecordStore::open(settings.records_file()));
    let mut controller = AutomationController::new(
        settings.clone(),
        Collaborators {
            surfaces: env.clone(),
            identities: env.clone(),
            records: records.clone(),
            clock: Arc::new(clock.clone()),
        },
        inbox,
    );

    controller.start(Some(RunTarget::new("Alice", 0))).unwrap();
    for _ in 0..2000 {
        clock.advance(Duration::from_millis(50));
        env.pump();
        controller.tick().unwrap();
        if controller.state() == AutomationState::Idle {
            break;
        }
    }

    let report = controller.last_report().unwrap();
    assert_eq!(report.end, RunEnd::Completed);
    assert!(report.recorded);
    assert_eq!(env.prices(), vec![799]);

    let reopened = JsonRunRecordStore::open(&path);
    let last = reopened.last_completion("Alice").unwrap();
    assert_eq!(last, records.last_completion("Alice").unwrap());
    assert!(matches!(
        eligibility(Some(last), clock.utc_now(), settings.cooldown(), 1),
        Eligibility::CoolingDown { .. }
    ));
    assert!(eligibility(
        Some(last),
        Utc::now() + chrono::Duration::hours(19),
        settings.cooldown(),
        1
    )
    .is_available());
}

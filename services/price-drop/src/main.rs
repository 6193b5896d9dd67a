//! Price Drop - dry run against the simulated environment
//!
//! Loads settings, checks the target's cooldown, then drives one full run
//! through the scripted surfaces:
//! 1. Select the retainer and open its sell list
//! 2. Compare prices for each listed item
//! 3. Undercut the lowest competing price
//! 4. Record the run and walk back to the retainer list

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use price_drop::driver::{self, SharedController};
use price_drop::records::eligibility;
use price_drop::sim::{SimScript, SimulatedEnvironment};
use price_drop::surface::names;
use price_drop::{
    quote_channel, AutomationController, Clock, Collaborators, JsonRunRecordStore, RunRecordSink,
    RunTarget, Settings, SurfaceProbe, SystemClock,
};
use tokio::sync::{watch, Mutex};
use tokio::time::interval;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("PRICE_DROP_CONFIG").ok().map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref())?;

    // Initialize logging
    let level = if settings.debug_mode {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("Starting Price Drop dry run...");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (feed, inbox) = quote_channel();
    let env = Arc::new(SimulatedEnvironment::new(SimScript::demo(), clock.clone(), feed));
    let records = Arc::new(JsonRunRecordStore::open(settings.records_file()));
    info!("Run records: {}", records.path().display());

    let target = RunTarget::new("Alice", 0);
    let status = eligibility(
        records.last_completion(&target.name),
        clock.utc_now(),
        settings.cooldown(),
        SimScript::demo().items.len(),
    );
    info!("{}: {}", target.name, status.describe());
    if !status.is_available() {
        return Ok(());
    }
    if !env.is_ready(names::RETAINER_LIST) {
        anyhow::bail!("Retainer list is not open");
    }

    let controller = AutomationController::new(
        settings.clone(),
        Collaborators {
            surfaces: env.clone(),
            identities: env.clone(),
            records: records.clone(),
            clock,
        },
        inbox,
    );
    let shared: SharedController = Arc::new(Mutex::new(controller));
    shared.lock().await.start(Some(target))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Host side: deliver market data as it comes due
    let pump_env = env.clone();
    let mut pump_shutdown = shutdown_rx.clone();
    let pump = tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(10));
        loop {
            tokio::select! {
                _ = ticker.tick() => { pump_env.pump(); }
                _ = pump_shutdown.changed() => break,
            }
        }
    });
    let ticker = driver::spawn_ticker(shared.clone(), settings.tick_interval(), shutdown_rx);

    let report = tokio::select! {
        report = driver::wait_until_idle(&shared, settings.tick_interval()) => report,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping automation");
            let mut controller = shared.lock().await;
            controller.stop();
            controller.last_report().cloned()
        }
    };

    let _ = shutdown_tx.send(true);
    ticker.await?;
    pump.await?;

    if let Some(report) = report {
        info!(
            "Run {} finished: {:?}, {} items processed, recorded: {}",
            report.run_id, report.end, report.processed, report.recorded
        );
        for item in &report.items {
            match item.submitted_price {
                Some(price) => info!(
                    "  #{} {}: {} -> {}",
                    item.index,
                    item.label.as_deref().unwrap_or("?"),
                    item.lowest_price.unwrap_or_default(),
                    price
                ),
                None => info!(
                    "  #{} {}: kept existing price",
                    item.index,
                    item.label.as_deref().unwrap_or("?")
                ),
            }
        }
        info!("Final prices: {:?}", env.prices());
        info!("Report: {}", serde_json::to_string(&report)?);
    }

    Ok(())
}

//! Tick driver - runs the controller on a fixed cadence

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::controller::{AutomationController, RunReport};

pub type SharedController = Arc<Mutex<AutomationController>>;

/// Tick the controller every `period` until `shutdown` flips to true
pub fn spawn_ticker(
    controller: SharedController,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut controller = controller.lock().await;
                    if let Err(e) = controller.tick() {
                        error!("Automation tick failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Tick driver shutting down");
                        break;
                    }
                }
            }
        }
    })
}

/// Wait until the controller is idle again and return the report of the run
pub async fn wait_until_idle(controller: &SharedController, poll: Duration) -> Option<RunReport> {
    let mut ticker = interval(poll);
    loop {
        ticker.tick().await;
        let controller = controller.lock().await;
        if !controller.is_running() {
            return controller.last_report().cloned();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::{Settings, TimeoutConfig};
    use crate::controller::{Collaborators, RunEnd};
    use crate::quote::{quote_channel, Listing};
    use crate::records::MemoryRunRecords;
    use crate::sim::{SimItem, SimScript, SimulatedEnvironment};

    fn fast_settings() -> Settings {
        Settings {
            action_delay_ms: 5,
            tick_interval_ms: 2,
            timeouts: TimeoutConfig {
                menu_settle_ms: 5,
                ..TimeoutConfig::default()
            },
            ..Settings::default()
        }
    }

    #[test]
    fn test_wait_until_idle_without_run() {
        let clock = Arc::new(SystemClock);
        let (feed, inbox) = quote_channel();
        let env = Arc::new(SimulatedEnvironment::new(
            SimScript::at_sell_list(vec![]),
            clock.clone(),
            feed,
        ));
        let controller = AutomationController::new(
            fast_settings(),
            Collaborators {
                surfaces: env.clone(),
                identities: env,
                records: Arc::new(MemoryRunRecords::new()),
                clock,
            },
            inbox,
        );
        let shared: SharedController = Arc::new(Mutex::new(controller));

        let report = tokio_test::block_on(wait_until_idle(&shared, Duration::from_millis(1)));
        assert!(report.is_none());
    }

    #[tokio::test]
    async fn test_ticker_drives_run_to_completion() {
        let settings = fast_settings();
        let clock = Arc::new(SystemClock);
        let (feed, inbox) = quote_channel();
        let mut script = SimScript::at_sell_list(vec![SimItem::responding(
            "Iron Ingot",
            1000,
            vec![Listing::new(700, false, "Other")],
        )]);
        script.surface_latency = Duration::from_millis(1);
        script.quote_latency = Duration::from_millis(5);
        let env = Arc::new(SimulatedEnvironment::new(script, clock.clone(), feed));

        let controller = AutomationController::new(
            settings.clone(),
            Collaborators {
                surfaces: env.clone(),
                identities: env.clone(),
                records: Arc::new(MemoryRunRecords::new()),
                clock,
            },
            inbox,
        );
        let shared: SharedController = Arc::new(Mutex::new(controller));
        shared.lock().await.start(None).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pump_env = env.clone();
        let mut pump_shutdown = shutdown_rx.clone();
        let pump = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => { pump_env.pump(); }
                    _ = pump_shutdown.changed() => break,
                }
            }
        });
        let ticker = spawn_ticker(shared.clone(), settings.tick_interval(), shutdown_rx);

        let report = tokio::time::timeout(
            Duration::from_secs(10),
            wait_until_idle(&shared, Duration::from_millis(5)),
        )
        .await
        .unwrap()
        .unwrap();

        shutdown_tx.send(true).unwrap();
        ticker.await.unwrap();
        pump.await.unwrap();

        assert_eq!(report.end, RunEnd::Completed);
        assert_eq!(report.processed, 1);
        assert_eq!(env.prices(), vec![699]);
    }
}

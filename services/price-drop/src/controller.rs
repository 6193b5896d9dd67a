//! Automation Controller - drives a price drop run one tick at a time
//!
//! The controller never blocks. Each tick evaluates the current state once:
//! either its precondition holds and it acts and moves on, or it stays put and
//! compares the time since its last action against a bounded wait.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::Settings;
use crate::error::{AutomationError, StartRejected};
use crate::pricing::{self, OwnIdentities, PriceResolution, QualityTier, SellingContext};
use crate::quote::{CorrelationId, ListingBatch, QuoteCorrelator, QuoteInbox, Rejection};
use crate::records::RunRecordSink;
use crate::state::AutomationState::{self, *};
use crate::surface::{names, opcodes, IdentitySource, SurfaceEvent, SurfaceProbe};

/// Retainer a run is started for
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunTarget {
    pub name: String,
    /// Position in the retainer list, used when the name cannot be found
    pub index: usize,
}

impl RunTarget {
    pub fn new(name: &str, index: usize) -> Self {
        Self {
            name: name.to_string(),
            index,
        }
    }
}

/// External collaborators the controller polls and writes through
#[derive(Clone)]
pub struct Collaborators {
    pub surfaces: Arc<dyn SurfaceProbe>,
    pub identities: Arc<dyn IdentitySource>,
    pub records: Arc<dyn RunRecordSink>,
    pub clock: Arc<dyn Clock>,
}

/// Per-run state, reset by `start`
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub target: Option<RunTarget>,
    /// Index of the item being worked on
    pub cursor: usize,
    pub processed: usize,
    /// Gates the cadence and every bounded wait
    pub last_action: Instant,
    pub tier: QualityTier,
    pub item_label: Option<String>,
    pub lowest_price: Option<u32>,
    pub quote_resolved: bool,
    pub submitted_price: Option<u32>,
    pub last_correlation_id: Option<CorrelationId>,
    /// Price editor open attempts for the current item
    pub open_attempts: u32,
    /// Sell option re-selected after the sell list failed to open
    pub sell_list_retried: bool,
    pub recorded: bool,
    pub items: Vec<ItemReport>,
}

impl RunContext {
    fn new(target: Option<RunTarget>, now: Instant) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            target,
            cursor: 0,
            processed: 0,
            last_action: now,
            tier: QualityTier::Standard,
            item_label: None,
            lowest_price: None,
            quote_resolved: false,
            submitted_price: None,
            last_correlation_id: None,
            open_attempts: 0,
            sell_list_retried: false,
            recorded: false,
            items: Vec::new(),
        }
    }

    fn reset_item(&mut self) {
        self.tier = QualityTier::Standard;
        self.item_label = None;
        self.lowest_price = None;
        self.quote_resolved = false;
        self.submitted_price = None;
        self.open_attempts = 0;
    }

    fn target_name(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.name.as_str())
    }
}

/// What happened to one confirmed item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    pub index: usize,
    pub label: Option<String>,
    pub tier: QualityTier,
    pub lowest_price: Option<u32>,
    /// `None` when the existing price was kept
    pub submitted_price: Option<u32>,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum RunEnd {
    Completed,
    Stopped,
    Aborted(String),
    Faulted(String),
}

/// Summary of the last finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub target: Option<String>,
    pub processed: usize,
    pub recorded: bool,
    pub items: Vec<ItemReport>,
    pub end: RunEnd,
}

/// Result of a single `tick`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    Paused,
    /// Minimum action spacing not yet elapsed
    Throttled,
    Stayed(AutomationState),
    Moved {
        from: AutomationState,
        to: AutomationState,
    },
}

/// The price drop state machine
pub struct AutomationController {
    settings: Settings,
    surfaces: Arc<dyn SurfaceProbe>,
    identities: Arc<dyn IdentitySource>,
    records: Arc<dyn RunRecordSink>,
    clock: Arc<dyn Clock>,
    inbox: QuoteInbox,
    correlator: QuoteCorrelator,
    state: AutomationState,
    paused: bool,
    run: RunContext,
    last_report: Option<RunReport>,
}

impl AutomationController {
    pub fn new(settings: Settings, collaborators: Collaborators, inbox: QuoteInbox) -> Self {
        let now = collaborators.clock.now();
        Self {
            settings,
            surfaces: collaborators.surfaces,
            identities: collaborators.identities,
            records: collaborators.records,
            clock: collaborators.clock,
            inbox,
            correlator: QuoteCorrelator::new(),
            state: Idle,
            paused: false,
            run: RunContext::new(None, now),
            last_report: None,
        }
    }

    pub fn state(&self) -> AutomationState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        !self.state.is_idle()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Context of the current (or most recent) run
    pub fn run(&self) -> &RunContext {
        &self.run
    }

    pub fn items_processed(&self) -> usize {
        self.run.processed
    }

    pub fn last_report(&self) -> Option<&RunReport> {
        self.last_report.as_ref()
    }

    /// Correlation id of the quote request still waiting for a batch
    pub fn outstanding_quote(&self) -> Option<CorrelationId> {
        self.correlator.outstanding().map(|r| r.id)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Begin a run.
    ///
    /// With a target the retainer list must be open and the run walks into the
    /// retainer first; without one the sell list must already be open.
    pub fn start(&mut self, target: Option<RunTarget>) -> Result<(), StartRejected> {
        if self.is_running() {
            warn!("Already running");
            return Err(StartRejected::AlreadyRunning(self.state));
        }

        let (origin, first) = match target {
            Some(_) => (names::RETAINER_LIST, SelectingRetainer),
            None => (names::SELL_LIST, GettingItemData),
        };
        if !self.surfaces.is_ready(origin) {
            error!("{} not open", origin);
            return Err(StartRejected::SurfaceNotReady { surface: origin });
        }

        debug_assert!(Idle.can_transition(first));
        self.run = RunContext::new(target, self.clock.now());
        self.paused = false;
        self.state = first;

        match self.run.target_name() {
            Some(name) => info!(
                "Starting automation for retainer: {} (run {})",
                name, self.run.run_id
            ),
            None => info!("Starting direct price drop automation (run {})", self.run.run_id),
        }
        Ok(())
    }

    /// Freeze all transitions. Quote delivery keeps queueing.
    pub fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            info!("Paused automation");
        }
    }

    pub fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            info!("Resumed automation");
        }
    }

    /// Return to idle immediately, abandoning any outstanding quote request
    pub fn stop(&mut self) {
        self.paused = false;
        if !self.is_running() {
            return;
        }
        if self.state.is_item_cycle() {
            warn!(
                "Stopping in {:?}, item {} may be left mid-edit",
                self.state, self.run.cursor
            );
        } else if self.state.is_unwinding() {
            info!("Stopping during teardown, surfaces may stay open");
        }
        self.finish(RunEnd::Stopped);
        info!("Stopped automation");
    }

    /// Evaluate the current state at most once.
    ///
    /// An error ends the run: the controller is idle when this returns `Err`.
    pub fn tick(&mut self) -> Result<TickOutcome, AutomationError> {
        if self.paused {
            return Ok(TickOutcome::Paused);
        }

        self.drain_quotes();

        if !self.is_running() {
            return Ok(TickOutcome::Idle);
        }

        let now = self.clock.now();
        if self.since_last_action(now) < self.settings.action_delay() {
            return Ok(TickOutcome::Throttled);
        }

        let from = self.state;
        match self.step(now) {
            Ok(()) if self.state == from => Ok(TickOutcome::Stayed(from)),
            Ok(()) => Ok(TickOutcome::Moved {
                from,
                to: self.state,
            }),
            Err(err) => {
                let end = if err.is_fault() {
                    error!("Automation error: {}", err);
                    RunEnd::Faulted(err.to_string())
                } else {
                    error!("{}", err);
                    RunEnd::Aborted(err.to_string())
                };
                self.finish(end);
                Err(err)
            }
        }
    }

    /// Human-readable progress text
    pub fn status(&self) -> String {
        let run = &self.run;
        let text = match self.state {
            Idle => "Ready".to_string(),
            SelectingRetainer => format!("Selecting {}", run.target_name().unwrap_or("retainer")),
            WaitingForDialogue => "Waiting for dialogue".to_string(),
            DismissingDialogue => "Dismissing dialogue".to_string(),
            WaitingForMenu => "Waiting for menu".to_string(),
            SelectingSellItems => "Selecting market option".to_string(),
            WaitingForSellList => "Loading market inventory".to_string(),
            GettingItemData => format!("Processing item {}", run.cursor + 1),
            OpeningItemMenu => "Opening context menu".to_string(),
            WaitingForContextMenu => "Waiting for context menu".to_string(),
            SelectingAdjustPrice => "Selecting adjust price".to_string(),
            WaitingForPriceEditor => "Loading price editor".to_string(),
            RequestingQuotes => "Fetching market data".to_string(),
            WaitingForQuotes => "Waiting for market data".to_string(),
            ClosingSearchResults => "Closing search window".to_string(),
            SettingPrice => match run.lowest_price {
                Some(lowest) => format!(
                    "Setting price to {}",
                    pricing::undercut(lowest, self.settings.undercut_amount)
                ),
                None => "No market data - keeping price".to_string(),
            },
            ConfirmingPrice => "Saving changes".to_string(),
            NextItem => "Moving to next item".to_string(),
            Finished => format!("Complete - {} items updated", run.processed),
            ClosingSellList => "Closing market inventory".to_string(),
            SelectingQuit => "Selecting quit option".to_string(),
            WaitingForDismissal => "Waiting for retainer dismissal".to_string(),
            WaitingForRetainerList => "Returning to retainer list".to_string(),
        };

        if self.paused && self.is_running() {
            format!("{} (paused)", text)
        } else {
            text
        }
    }

    fn step(&mut self, now: Instant) -> Result<(), AutomationError> {
        match self.state {
            Idle => Ok(()),
            SelectingRetainer => self.select_retainer(now),
            WaitingForDialogue => self.wait_for_dialogue(now),
            DismissingDialogue => self.dismiss_dialogue(now),
            WaitingForMenu => self.wait_for_menu(now),
            SelectingSellItems => self.select_sell_items(now),
            WaitingForSellList => self.wait_for_sell_list(now),
            GettingItemData => self.get_item_data(now),
            OpeningItemMenu => self.open_item_menu(now),
            WaitingForContextMenu => self.wait_for_context_menu(now),
            SelectingAdjustPrice => self.select_adjust_price(now),
            WaitingForPriceEditor => self.wait_for_price_editor(now),
            RequestingQuotes => self.request_quotes(now),
            WaitingForQuotes => self.wait_for_quotes(now),
            ClosingSearchResults => self.close_search_results(now),
            SettingPrice => self.set_price(now),
            ConfirmingPrice => self.confirm_price(now),
            NextItem => self.next_item(now),
            Finished => self.handle_finished(now),
            ClosingSellList => self.close_sell_list(now),
            SelectingQuit => self.select_quit(now),
            WaitingForDismissal => self.wait_for_dismissal(now),
            WaitingForRetainerList => self.wait_for_retainer_list(now),
        }
    }

    fn transition(&mut self, to: AutomationState, now: Instant) -> Result<(), AutomationError> {
        if !self.state.can_transition(to) {
            return Err(AutomationError::IllegalTransition {
                from: self.state,
                to,
            });
        }
        debug!("{:?} -> {:?}", self.state, to);
        self.state = to;
        self.run.last_action = now;
        Ok(())
    }

    fn since_last_action(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.run.last_action)
    }

    fn send(&self, surface: &'static str, event: SurfaceEvent) -> Result<(), AutomationError> {
        debug!("Sending {} to {}", event, surface);
        self.surfaces
            .send(surface, event)
            .map_err(|e| AutomationError::surface(surface, e))
    }

    /// Bound for states that have no dedicated timeout
    fn check_stall(&self, now: Instant, surface: &'static str) -> Result<(), AutomationError> {
        let waited = self.since_last_action(now);
        if waited > self.settings.timeouts.stall() {
            return Err(AutomationError::Timeout {
                state: self.state,
                surface,
                waited,
            });
        }
        Ok(())
    }

    /// Re-open the price editor, or give up once the retry budget is spent
    fn retry_open(&mut self, now: Instant, surface: &'static str) -> Result<(), AutomationError> {
        if self.run.open_attempts > self.settings.max_open_retries {
            return Err(AutomationError::Timeout {
                state: self.state,
                surface,
                waited: self.since_last_action(now),
            });
        }
        warn!("{} failed to open for item {}, retrying", surface, self.run.cursor);
        self.transition(OpeningItemMenu, now)
    }

    fn select_retainer(&mut self, now: Instant) -> Result<(), AutomationError> {
        if !self.surfaces.is_ready(names::RETAINER_LIST) {
            return self.check_stall(now, names::RETAINER_LIST);
        }
        let Some(target) = self.run.target.clone() else {
            return Err(AutomationError::Aborted("no target retainer".to_string()));
        };

        info!("Attempting to select retainer: {}", target.name);
        let retainers = self.surfaces.entries(names::RETAINER_LIST);
        let index = match retainers.iter().position(|name| *name == target.name) {
            Some(index) => {
                info!("Found retainer {} at index {}, selecting...", target.name, index);
                index
            }
            None if target.index < retainers.len() => {
                warn!(
                    "Could not find retainer '{}' by name, selecting index {}: {}",
                    target.name, target.index, retainers[target.index]
                );
                target.index
            }
            None => {
                return Err(AutomationError::Aborted(format!(
                    "Could not find retainer '{}' at index {}",
                    target.name, target.index
                )));
            }
        };

        self.send(
            names::RETAINER_LIST,
            SurfaceEvent::new(opcodes::SELECT).with(index as i64),
        )?;
        self.transition(WaitingForDialogue, now)
    }

    fn wait_for_dialogue(&mut self, now: Instant) -> Result<(), AutomationError> {
        if self.surfaces.is_ready(names::TALK) {
            info!("Dialogue appeared, waiting to dismiss");
            return self.transition(DismissingDialogue, now);
        }
        // The greeting is sometimes skipped entirely
        if self.since_last_action(now) > self.settings.timeouts.menu()
            && self.surfaces.is_ready(names::SELECT_STRING)
        {
            info!("SelectString already open, skipping dialogue");
            return self.transition(SelectingSellItems, now);
        }
        self.check_stall(now, names::TALK)
    }

    fn dismiss_dialogue(&mut self, now: Instant) -> Result<(), AutomationError> {
        if self.surfaces.is_ready(names::TALK) {
            self.send(names::TALK, SurfaceEvent::new(opcodes::ADVANCE))?;
            info!("Dismissed dialogue");
        } else {
            info!("Talk window no longer present, waiting for SelectString");
        }
        self.transition(WaitingForMenu, now)
    }

    fn wait_for_menu(&mut self, now: Instant) -> Result<(), AutomationError> {
        if self.surfaces.is_ready(names::SELECT_STRING) {
            info!("SelectString menu opened");
            return self.transition(SelectingSellItems, now);
        }
        if self.since_last_action(now) > self.settings.timeouts.menu() {
            warn!("SelectString wait timeout, attempting to select anyway");
            return self.transition(SelectingSellItems, now);
        }
        Ok(())
    }

    fn select_sell_items(&mut self, now: Instant) -> Result<(), AutomationError> {
        if !self.surfaces.is_ready(names::SELECT_STRING) {
            debug!("SelectString not ready, will retry");
            return self.check_stall(now, names::SELECT_STRING);
        }
        if self.since_last_action(now) < self.settings.timeouts.menu_settle() {
            return Ok(());
        }

        self.send(
            names::SELECT_STRING,
            SurfaceEvent::new(opcodes::SELECT)
                .with(self.settings.sell_option_index)
                .with(0i64),
        )?;
        info!("Selected sell items option");
        self.transition(WaitingForSellList, now)
    }

    fn wait_for_sell_list(&mut self, now: Instant) -> Result<(), AutomationError> {
        if self.surfaces.is_ready(names::SELL_LIST) {
            info!("RetainerSellList opened successfully");
            return self.transition(GettingItemData, now);
        }
        let waited = self.since_last_action(now);
        if waited > self.settings.timeouts.list() {
            if !self.run.sell_list_retried {
                self.run.sell_list_retried = true;
                warn!("RetainerSellList failed to open, selecting sell items again");
                return self.transition(SelectingSellItems, now);
            }
            return Err(AutomationError::Timeout {
                state: self.state,
                surface: names::SELL_LIST,
                waited,
            });
        }
        Ok(())
    }

    fn get_item_data(&mut self, now: Instant) -> Result<(), AutomationError> {
        if !self.surfaces.is_ready(names::SELL_LIST) {
            return self.check_stall(now, names::SELL_LIST);
        }

        let count = self.surfaces.item_count(names::SELL_LIST).unwrap_or(0);
        if self.run.cursor >= self.settings.max_items_per_run {
            info!(
                "Reached maximum items ({}), finishing...",
                self.settings.max_items_per_run
            );
            self.transition(Finished, now)
        } else if self.run.cursor < count {
            info!("Processing item {} of {}", self.run.cursor + 1, count);
            self.run.reset_item();
            self.transition(OpeningItemMenu, now)
        } else {
            info!("No items to process. Total processed: {}", self.run.processed);
            self.transition(Finished, now)
        }
    }

    fn open_item_menu(&mut self, now: Instant) -> Result<(), AutomationError> {
        if !self.surfaces.is_ready(names::SELL_LIST) {
            return self.check_stall(now, names::SELL_LIST);
        }

        let count = self.surfaces.item_count(names::SELL_LIST).unwrap_or(0);
        if self.run.cursor >= count {
            info!("Completed all {} items", count);
            return self.transition(Finished, now);
        }

        let event = SurfaceEvent::new(opcodes::OPEN_ITEM_MENU)
            .with(0i64)
            .with(self.run.cursor as i64)
            .with(1i64);
        self.run.open_attempts += 1;
        self.send(names::SELL_LIST, event)?;
        debug!(
            "Opened context menu for item {} (attempt {})",
            self.run.cursor, self.run.open_attempts
        );
        self.transition(WaitingForContextMenu, now)
    }

    fn wait_for_context_menu(&mut self, now: Instant) -> Result<(), AutomationError> {
        if self.surfaces.is_ready(names::CONTEXT_MENU) {
            info!("Context menu opened successfully");
            // First entry is "Adjust Price"
            self.send(
                names::CONTEXT_MENU,
                SurfaceEvent::new(opcodes::SELECT)
                    .with(0i64)
                    .with(0i64)
                    .with(0i64),
            )?;
            return self.transition(SelectingAdjustPrice, now);
        }
        if self.since_last_action(now) > self.settings.timeouts.context_menu() {
            return self.retry_open(now, names::CONTEXT_MENU);
        }
        Ok(())
    }

    fn select_adjust_price(&mut self, now: Instant) -> Result<(), AutomationError> {
        if !self.surfaces.exists(names::PRICE_EDITOR)
            && self.surfaces.is_ready(names::CONTEXT_MENU)
        {
            warn!("Context menu ignored selection, trying alternative");
            self.send(
                names::CONTEXT_MENU,
                SurfaceEvent::new(opcodes::SELECT_ALT)
                    .with(0i64)
                    .with(0i64)
                    .with(0i64),
            )?;
        }
        self.transition(WaitingForPriceEditor, now)
    }

    fn wait_for_price_editor(&mut self, now: Instant) -> Result<(), AutomationError> {
        if self.surfaces.is_ready(names::PRICE_EDITOR) {
            match self.surfaces.label(names::PRICE_EDITOR) {
                Some(label) => {
                    self.run.tier = QualityTier::from_label(&label);
                    info!(
                        "RetainerSell opened - Selling {} item: {}",
                        self.run.tier.short(),
                        label
                    );
                    self.run.item_label = Some(label);
                }
                None => {
                    self.run.tier = QualityTier::Standard;
                    warn!("Could not read item name from RetainerSell");
                }
            }
            return self.transition(RequestingQuotes, now);
        }
        if self.since_last_action(now) > self.settings.timeouts.editor() {
            return self.retry_open(now, names::PRICE_EDITOR);
        }
        Ok(())
    }

    fn request_quotes(&mut self, now: Instant) -> Result<(), AutomationError> {
        if !self.surfaces.is_ready(names::PRICE_EDITOR) {
            return self.check_stall(now, names::PRICE_EDITOR);
        }

        let request = self.correlator.issue(now);
        self.run.last_correlation_id = Some(request.id);
        self.run.lowest_price = None;
        self.run.quote_resolved = false;

        self.send(
            names::PRICE_EDITOR,
            SurfaceEvent::new(opcodes::COMPARE_PRICES).with(request.id.0 as i64),
        )?;
        info!("Clicked Compare Prices ({}), waiting for market data", request.id);
        self.transition(WaitingForQuotes, now)
    }

    fn wait_for_quotes(&mut self, now: Instant) -> Result<(), AutomationError> {
        if self.run.quote_resolved {
            match self.run.lowest_price {
                Some(price) => info!("Market data received: {}", price),
                None => info!("Market data received without a usable price"),
            }
            return self.transition(ClosingSearchResults, now);
        }

        let expired = self
            .correlator
            .outstanding()
            .map(|request| request.is_expired(now, self.settings.timeouts.quote()))
            .unwrap_or(true);
        if !expired {
            return Ok(());
        }

        if self.surfaces.is_ready(names::SEARCH_RESULTS) {
            warn!("Timeout waiting for market data - will skip price update");
        } else {
            warn!("ItemSearchResult failed to open - will skip price update");
        }
        self.correlator.abandon();
        self.run.lowest_price = None;
        self.transition(ClosingSearchResults, now)
    }

    fn drain_quotes(&mut self) {
        for batch in self.inbox.drain() {
            let id = batch.correlation_id;
            match self.correlator.accept(batch) {
                Ok(batch) => self.apply_batch(batch),
                Err(Rejection::Unsolicited) => debug!("Discarded unsolicited batch {}", id),
                Err(Rejection::Stale { outstanding }) => {
                    debug!("Discarded stale batch {} (waiting for {})", id, outstanding)
                }
            }
        }
    }

    fn apply_batch(&mut self, batch: ListingBatch) {
        info!(
            "Market board data received for {} listings ({})",
            batch.listings.len(),
            batch.correlation_id
        );
        for (i, listing) in batch.listings.iter().take(5).enumerate() {
            debug!(
                "  Listing {}: {} - {} - {}",
                i + 1,
                listing.price_per_unit,
                if listing.premium { "HQ" } else { "NQ" },
                listing.seller
            );
        }

        let own = OwnIdentities::from_names(self.identities.own_identities());
        let context = SellingContext { tier: self.run.tier };
        let resolution = pricing::resolve(&batch.listings, &context, &own);
        match &resolution {
            PriceResolution::Lowest {
                price,
                premium,
                seller,
            } => info!(
                "Lowest {} market price found: {} (from retainer: {})",
                if *premium { "HQ" } else { "NQ" },
                price,
                seller
            ),
            PriceResolution::NoData => warn!("No market listings found, will skip price update"),
        }

        self.run.lowest_price = resolution.price();
        self.run.quote_resolved = true;
    }

    fn close_search_results(&mut self, now: Instant) -> Result<(), AutomationError> {
        if self.surfaces.is_ready(names::SEARCH_RESULTS) {
            self.send(names::SEARCH_RESULTS, SurfaceEvent::new(opcodes::DISMISS))?;
            info!("Closed ItemSearchResult");
        }
        self.transition(SettingPrice, now)
    }

    fn set_price(&mut self, now: Instant) -> Result<(), AutomationError> {
        if !self.surfaces.is_ready(names::PRICE_EDITOR) {
            return self.check_stall(now, names::PRICE_EDITOR);
        }

        match self.run.lowest_price {
            None => info!("No market data available - keeping existing price"),
            Some(lowest) => {
                let undercut_amount = self.settings.undercut_amount;
                let new_price = pricing::undercut(lowest, undercut_amount);
                info!(
                    "Calculating price: Market={}, Undercut={}, NewPrice={}",
                    lowest, undercut_amount, new_price
                );
                self.send(
                    names::PRICE_EDITOR,
                    SurfaceEvent::new(opcodes::SET_PRICE)
                        .with(new_price as i64)
                        .with(0i64),
                )?;
                self.run.submitted_price = Some(new_price);
            }
        }
        self.transition(ConfirmingPrice, now)
    }

    fn confirm_price(&mut self, now: Instant) -> Result<(), AutomationError> {
        if !self.surfaces.is_ready(names::PRICE_EDITOR) {
            return self.check_stall(now, names::PRICE_EDITOR);
        }

        self.send(names::PRICE_EDITOR, SurfaceEvent::new(opcodes::ADVANCE))?;
        self.run.processed += 1;
        let report = ItemReport {
            index: self.run.cursor,
            label: self.run.item_label.clone(),
            tier: self.run.tier,
            lowest_price: self.run.lowest_price,
            submitted_price: self.run.submitted_price,
        };
        self.run.items.push(report);
        info!("Confirmed price change for item {}", self.run.cursor);
        self.transition(NextItem, now)
    }

    fn next_item(&mut self, now: Instant) -> Result<(), AutomationError> {
        self.run.cursor += 1;
        if self.run.cursor >= self.settings.max_items_per_run {
            info!(
                "Reached maximum items ({}), finishing...",
                self.settings.max_items_per_run
            );
            self.transition(Finished, now)
        } else {
            self.transition(GettingItemData, now)
        }
    }

    fn handle_finished(&mut self, now: Instant) -> Result<(), AutomationError> {
        info!("Completed all items. Processed: {}", self.run.processed);
        self.run.recorded = self.record_completion();

        match self.run.target_name() {
            Some(name) => {
                info!("Starting dismissal sequence for retainer {}", name);
                self.transition(ClosingSellList, now)
            }
            None => {
                info!("No target retainer, stopping here");
                self.finish(RunEnd::Completed);
                Ok(())
            }
        }
    }

    /// Record the run for named targets that had at least one item confirmed
    fn record_completion(&self) -> bool {
        let Some(name) = self.run.target_name() else {
            return false;
        };
        if self.run.processed == 0 {
            return false;
        }
        match self.records.record_completion(name, self.clock.utc_now()) {
            Ok(()) => {
                info!("Recorded price drop timestamp for {}", name);
                true
            }
            Err(e) => {
                warn!("Failed to record price drop for {}: {:#}", name, e);
                false
            }
        }
    }

    fn close_sell_list(&mut self, now: Instant) -> Result<(), AutomationError> {
        if self.surfaces.is_ready(names::SELL_LIST) {
            self.surfaces
                .close(names::SELL_LIST)
                .map_err(|e| AutomationError::surface(names::SELL_LIST, e))?;
            info!("Closed RetainerSellList");
            return self.transition(SelectingQuit, now);
        }
        if self.surfaces.is_ready(names::SELECT_STRING) {
            info!("RetainerSellList already closed, SelectString is open");
            return self.transition(SelectingQuit, now);
        }
        if self.since_last_action(now) > self.settings.timeouts.close_list() {
            warn!("Timeout waiting for SelectString after closing RetainerSellList");
            return self.transition(SelectingQuit, now);
        }
        Ok(())
    }

    fn select_quit(&mut self, now: Instant) -> Result<(), AutomationError> {
        if self.surfaces.is_ready(names::SELECT_STRING) {
            let entries = self.surfaces.entries(names::SELECT_STRING);
            // Quit is the last entry
            if let Some(last) = entries.len().checked_sub(1) {
                info!("Selecting Quit option: '{}'", entries[last]);
                self.send(
                    names::SELECT_STRING,
                    SurfaceEvent::new(opcodes::SELECT).with(last as i64),
                )?;
            } else {
                warn!("SelectString has no entries, skipping Quit");
            }
            return self.transition(WaitingForDismissal, now);
        }
        if self.since_last_action(now) > self.settings.timeouts.menu() {
            warn!("SelectString not found, might already be dismissed");
            return self.transition(WaitingForRetainerList, now);
        }
        Ok(())
    }

    fn wait_for_dismissal(&mut self, now: Instant) -> Result<(), AutomationError> {
        if self.surfaces.exists(names::TALK) {
            info!("Found Talk dialogue after Quit, clicking through it");
            self.send(names::TALK, SurfaceEvent::new(opcodes::ADVANCE))?;
            return self.transition(WaitingForRetainerList, now);
        }
        if self.since_last_action(now) > self.settings.timeouts.dismissal_grace() {
            return self.transition(WaitingForRetainerList, now);
        }
        Ok(())
    }

    fn wait_for_retainer_list(&mut self, now: Instant) -> Result<(), AutomationError> {
        if self.surfaces.is_ready(names::RETAINER_LIST) {
            info!("Successfully returned to RetainerList");
            self.finish(RunEnd::Completed);
        } else if self.since_last_action(now) > self.settings.timeouts.return_to_origin() {
            warn!("Timeout waiting for RetainerList - stopping anyway");
            self.finish(RunEnd::Completed);
        }
        Ok(())
    }

    /// End the run in any state
    fn finish(&mut self, end: RunEnd) {
        self.correlator.abandon();
        let report = RunReport {
            run_id: self.run.run_id,
            target: self.run.target.as_ref().map(|t| t.name.clone()),
            processed: self.run.processed,
            recorded: self.run.recorded,
            items: self.run.items.clone(),
            end,
        };
        info!(
            "Run {} ended ({:?}) after {} items",
            report.run_id, report.end, report.processed
        );
        self.last_report = Some(report);
        self.state = Idle;
        self.paused = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::quote::{quote_channel, Listing, QuoteFeed};
    use crate::records::MemoryRunRecords;
    use crate::sim::{SimItem, SimScript, SimulatedEnvironment};

    struct Harness {
        clock: ManualClock,
        env: Arc<SimulatedEnvironment>,
        records: Arc<MemoryRunRecords>,
        feed: QuoteFeed,
        controller: AutomationController,
    }

    fn harness(script: SimScript, settings: Settings) -> Harness {
        let clock = ManualClock::new();
        let (feed, inbox) = quote_channel();
        let env = Arc::new(SimulatedEnvironment::new(
            script,
            Arc::new(clock.clone()),
            feed.clone(),
        ));
        let records = Arc::new(MemoryRunRecords::new());
        let controller = AutomationController::new(
            settings,
            Collaborators {
                surfaces: env.clone(),
                identities: env.clone(),
                records: records.clone(),
                clock: Arc::new(clock.clone()),
            },
            inbox,
        );
        Harness {
            clock,
            env,
            records,
            feed,
            controller,
        }
    }

    impl Harness {
        fn advance(&mut self, ms: u64) -> Result<TickOutcome, AutomationError> {
            self.clock.advance(Duration::from_millis(ms));
            self.env.pump();
            self.controller.tick()
        }

        fn run_until(&mut self, state: AutomationState) {
            for _ in 0..2000 {
                if self.controller.state() == state {
                    return;
                }
                self.advance(50).unwrap();
            }
            panic!("never reached {:?}", state);
        }
    }

    fn items(prices: &[u32]) -> Vec<SimItem> {
        prices
            .iter()
            .enumerate()
            .map(|(i, p)| {
                SimItem::responding(
                    &format!("Item {}", i),
                    *p,
                    vec![Listing::new(500, false, "Rival"), Listing::new(800, false, "Other")],
                )
            })
            .collect()
    }

    #[test]
    fn test_tick_is_noop_while_idle() {
        let mut h = harness(SimScript::at_sell_list(items(&[1000])), Settings::default());
        assert_eq!(h.advance(500).unwrap(), TickOutcome::Idle);
        assert_eq!(h.controller.status(), "Ready");
    }

    #[test]
    fn test_cadence_throttles_actions() {
        let mut h = harness(SimScript::at_sell_list(items(&[1000])), Settings::default());
        h.controller.start(None).unwrap();

        assert_eq!(h.advance(100).unwrap(), TickOutcome::Throttled);
        assert_eq!(
            h.advance(100).unwrap(),
            TickOutcome::Moved {
                from: GettingItemData,
                to: OpeningItemMenu
            }
        );
        assert_eq!(h.advance(50).unwrap(), TickOutcome::Throttled);
    }

    #[test]
    fn test_start_rejections() {
        let mut h = harness(SimScript::at_sell_list(items(&[1000])), Settings::default());
        assert_eq!(
            h.controller.start(Some(RunTarget::new("Alice", 0))),
            Err(StartRejected::SurfaceNotReady {
                surface: names::RETAINER_LIST
            })
        );

        h.controller.start(None).unwrap();
        assert_eq!(
            h.controller.start(None),
            Err(StartRejected::AlreadyRunning(GettingItemData))
        );
    }

    #[test]
    fn test_pause_is_idempotent_and_freezes_state() {
        let mut h = harness(SimScript::at_sell_list(items(&[1000])), Settings::default());
        h.controller.start(None).unwrap();

        h.controller.pause();
        h.controller.pause();
        assert!(h.controller.is_paused());
        assert_eq!(h.controller.status(), "Processing item 1 (paused)");

        for _ in 0..20 {
            assert_eq!(h.advance(200).unwrap(), TickOutcome::Paused);
        }
        assert_eq!(h.controller.state(), GettingItemData);

        h.controller.resume();
        h.controller.resume();
        assert!(!h.controller.is_paused());
        assert!(matches!(h.advance(50).unwrap(), TickOutcome::Moved { .. }));
    }

    #[test]
    fn test_stale_batch_does_not_touch_price() {
        let mut h = harness(SimScript::at_sell_list(items(&[1000])), Settings::default());
        h.controller.start(None).unwrap();
        h.run_until(WaitingForQuotes);

        let outstanding = h.controller.outstanding_quote().unwrap();
        let stale = CorrelationId(outstanding.0 + 100);
        h.feed.deliver(stale, vec![Listing::new(5, false, "Spoiler")]);
        h.feed.deliver(CorrelationId(0), vec![Listing::new(6, false, "Spoiler")]);
        h.advance(0).unwrap();

        assert_eq!(h.controller.run().lowest_price, None);
        assert!(!h.controller.run().quote_resolved);
        assert_eq!(h.controller.outstanding_quote(), Some(outstanding));

        h.run_until(SettingPrice);
        assert_eq!(h.controller.run().lowest_price, Some(500));
    }

    #[test]
    fn test_status_reports_pending_price() {
        let settings = Settings {
            undercut_amount: 10,
            ..Settings::default()
        };
        let mut h = harness(SimScript::at_sell_list(items(&[1000])), settings);
        h.controller.start(None).unwrap();
        h.run_until(SettingPrice);
        assert_eq!(h.controller.status(), "Setting price to 490");
    }

    #[test]
    fn test_direct_run_records_nothing() {
        let mut h = harness(SimScript::at_sell_list(items(&[1000, 900])), Settings::default());
        h.controller.start(None).unwrap();
        h.run_until(Idle);

        let report = h.controller.last_report().unwrap();
        assert_eq!(report.end, RunEnd::Completed);
        assert_eq!(report.processed, 2);
        assert!(!report.recorded);
        assert!(h.records.is_empty());
        // No teardown without a target
        assert!(h.env.is_open(names::SELL_LIST));
    }
}

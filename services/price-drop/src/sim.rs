//! Simulated Environment - scripted surfaces for dry runs and tests
//!
//! Reacts to the events the controller sends the way the real host does:
//! surfaces appear after a latency, quote batches arrive later through the
//! feed (or never), and confirmed prices are written back to the items.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::clock::Clock;
use crate::quote::{CorrelationId, Listing, QuoteFeed};
use crate::surface::{names, opcodes, IdentitySource, SurfaceEvent, SurfaceProbe, PREMIUM_GLYPH};

/// Options of the retainer menu; the last one is always Quit
pub const MENU_ENTRIES: [&str; 6] = [
    "View venture report",
    "Entrust or withdraw items",
    "Entrust or withdraw gil",
    "Sell items in your inventory on the market",
    "View sale history",
    "Quit",
];

/// Menu index that opens the sell list
const SELL_OPTION: i64 = 2;

/// How the market answers a price comparison for an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimQuote {
    Respond(Vec<Listing>),
    /// No batch is ever delivered
    Silent,
}

/// One item on the simulated market
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimItem {
    pub label: String,
    pub price: u32,
    pub quote: SimQuote,
}

impl SimItem {
    pub fn responding(label: &str, price: u32, listings: Vec<Listing>) -> Self {
        Self {
            label: label.to_string(),
            price,
            quote: SimQuote::Respond(listings),
        }
    }

    pub fn silent(label: &str, price: u32) -> Self {
        Self {
            label: label.to_string(),
            price,
            quote: SimQuote::Silent,
        }
    }
}

/// Scripted world the simulation starts from
#[derive(Debug, Clone)]
pub struct SimScript {
    pub retainers: Vec<String>,
    pub own_identities: Vec<String>,
    pub items: Vec<SimItem>,
    /// Surface open when the simulation starts
    pub origin: &'static str,
    pub surface_latency: Duration,
    pub quote_latency: Duration,
    /// Whether the retainer greets (and says goodbye) through a dialogue
    pub greeting: bool,
    /// Number of item menu opens to swallow without reacting
    pub ignored_opens: u32,
    /// Number of sell option selections to swallow without reacting
    pub ignored_sell_selects: u32,
    /// Whether leaving the retainer brings the retainer list back
    pub returns_to_list: bool,
    /// Whether closing the sell list brings up the retainer menu
    pub quit_menu: bool,
    /// Whether the retainer menu offers no options on the way out
    pub empty_quit_menu: bool,
    /// Host closes the sell list on its own once the last item is confirmed
    pub drops_sell_list: bool,
    /// Surface whose event dispatch faults
    pub failing_surface: Option<&'static str>,
}

impl SimScript {
    /// Standing at the retainer list
    pub fn at_retainer_list(retainers: &[&str], items: Vec<SimItem>) -> Self {
        Self {
            retainers: retainers.iter().map(|r| r.to_string()).collect(),
            own_identities: retainers.iter().map(|r| r.to_string()).collect(),
            items,
            origin: names::RETAINER_LIST,
            surface_latency: Duration::from_millis(100),
            quote_latency: Duration::from_millis(300),
            greeting: true,
            ignored_opens: 0,
            ignored_sell_selects: 0,
            returns_to_list: true,
            quit_menu: true,
            empty_quit_menu: false,
            drops_sell_list: false,
            failing_surface: None,
        }
    }

    /// Already inside a retainer's sell list
    pub fn at_sell_list(items: Vec<SimItem>) -> Self {
        Self {
            origin: names::SELL_LIST,
            ..Self::at_retainer_list(&[], items)
        }
    }

    pub fn with_own_identities(mut self, names: &[&str]) -> Self {
        self.own_identities = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn without_greeting(mut self) -> Self {
        self.greeting = false;
        self
    }

    pub fn ignoring_opens(mut self, count: u32) -> Self {
        self.ignored_opens = count;
        self
    }

    pub fn ignoring_sell_selects(mut self, count: u32) -> Self {
        self.ignored_sell_selects = count;
        self
    }

    pub fn without_return(mut self) -> Self {
        self.returns_to_list = false;
        self
    }

    pub fn without_quit_menu(mut self) -> Self {
        self.quit_menu = false;
        self
    }

    pub fn with_empty_quit_menu(mut self) -> Self {
        self.empty_quit_menu = true;
        self
    }

    pub fn dropping_sell_list(mut self) -> Self {
        self.drops_sell_list = true;
        self
    }

    pub fn failing(mut self, surface: &'static str) -> Self {
        self.failing_surface = Some(surface);
        self
    }

    /// World used by the dry run binary
    pub fn demo() -> Self {
        let premium_label = format!("Rarefied Tincture {}", PREMIUM_GLYPH);
        Self::at_retainer_list(
            &["Alice", "Bob"],
            vec![
                SimItem::responding(
                    "Iron Ingot",
                    1200,
                    vec![
                        Listing::new(950, false, "Merchant"),
                        Listing::new(900, false, "Alice"),
                        Listing::new(1010, true, "Trader"),
                    ],
                ),
                SimItem::responding(
                    &premium_label,
                    8000,
                    vec![
                        Listing::new(4000, false, "Merchant"),
                        Listing::new(7400, true, "Trader"),
                    ],
                ),
                SimItem::silent("Cotton Boll", 40),
            ],
        )
        .with_own_identities(&["Alice=Home", "Bob=Home"])
    }
}

/// An event the controller sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEvent {
    pub surface: String,
    pub event: SurfaceEvent,
}

/// A price editor confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub index: usize,
    pub price: u32,
    pub changed: bool,
}

#[derive(Debug)]
struct SimState {
    /// Open surfaces and the instant each becomes ready
    open: HashMap<String, Instant>,
    items: Vec<SimItem>,
    selected: Option<usize>,
    pending_price: Option<u32>,
    pending_quotes: Vec<(Instant, CorrelationId, Vec<Listing>)>,
    ignored_opens: u32,
    ignored_sell_selects: u32,
    /// Sell list closed, walking back out
    leaving: bool,
    events: Vec<SentEvent>,
    confirmations: Vec<Confirmation>,
}

impl SimState {
    fn open(&mut self, name: &str, ready_at: Instant) {
        self.open.insert(name.to_string(), ready_at);
    }

    fn close(&mut self, name: &str) {
        self.open.remove(name);
    }

    fn is_ready(&self, name: &str, now: Instant) -> bool {
        self.open.get(name).map(|at| now >= *at).unwrap_or(false)
    }
}

/// Scripted stand-in for the host environment
pub struct SimulatedEnvironment {
    script: SimScript,
    clock: Arc<dyn Clock>,
    feed: QuoteFeed,
    state: Mutex<SimState>,
}

impl SimulatedEnvironment {
    pub fn new(script: SimScript, clock: Arc<dyn Clock>, feed: QuoteFeed) -> Self {
        let now = clock.now();
        let mut state = SimState {
            open: HashMap::new(),
            items: script.items.clone(),
            selected: None,
            pending_price: None,
            pending_quotes: Vec::new(),
            ignored_opens: script.ignored_opens,
            ignored_sell_selects: script.ignored_sell_selects,
            leaving: false,
            events: Vec::new(),
            confirmations: Vec::new(),
        };
        state.open(script.origin, now);

        Self {
            script,
            clock,
            feed,
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver every quote batch that is due. Returns how many were sent.
    pub fn pump(&self) -> usize {
        let now = self.clock.now();
        let due: Vec<(Instant, CorrelationId, Vec<Listing>)> = {
            let mut state = self.state();
            let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending_quotes)
                .into_iter()
                .partition(|(at, _, _)| *at <= now);
            state.pending_quotes = pending;
            due
        };

        let count = due.len();
        for (_, id, listings) in due {
            debug!("Delivering {} listings for {}", listings.len(), id);
            self.feed.deliver(id, listings);
        }
        count
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.state().open.contains_key(name)
    }

    /// Current price of every item
    pub fn prices(&self) -> Vec<u32> {
        self.state().items.iter().map(|i| i.price).collect()
    }

    pub fn confirmations(&self) -> Vec<Confirmation> {
        self.state().confirmations.clone()
    }

    pub fn events(&self) -> Vec<SentEvent> {
        self.state().events.clone()
    }

    /// Values written into the price editor, in order
    pub fn submitted_prices(&self) -> Vec<i64> {
        self.state()
            .events
            .iter()
            .filter(|e| e.surface == names::PRICE_EDITOR && e.event.opcode == opcodes::SET_PRICE)
            .filter_map(|e| e.event.int(0))
            .collect()
    }

    fn ready_at(&self, now: Instant) -> Instant {
        now + self.script.surface_latency
    }

    fn react(&self, state: &mut SimState, name: &str, event: &SurfaceEvent, now: Instant) {
        let ready_at = self.ready_at(now);
        match (name, event.opcode) {
            (names::RETAINER_LIST, opcodes::SELECT) => {
                state.close(names::RETAINER_LIST);
                if self.script.greeting {
                    state.open(names::TALK, ready_at);
                } else {
                    state.open(names::SELECT_STRING, ready_at);
                }
            }
            (names::TALK, opcodes::ADVANCE) => {
                state.close(names::TALK);
                if state.leaving {
                    if self.script.returns_to_list {
                        state.open(names::RETAINER_LIST, ready_at);
                    }
                } else {
                    state.open(names::SELECT_STRING, ready_at);
                }
            }
            (names::SELECT_STRING, opcodes::SELECT) => {
                let choice = event.int(0);
                let quit = (MENU_ENTRIES.len() - 1) as i64;
                if state.leaving && choice == Some(quit) {
                    state.close(names::SELECT_STRING);
                    if self.script.greeting {
                        state.open(names::TALK, ready_at);
                    } else if self.script.returns_to_list {
                        state.open(names::RETAINER_LIST, ready_at);
                    }
                } else if !state.leaving && choice == Some(SELL_OPTION) {
                    if state.ignored_sell_selects > 0 {
                        state.ignored_sell_selects -= 1;
                        debug!("Swallowed sell option {}", event);
                        return;
                    }
                    state.close(names::SELECT_STRING);
                    state.open(names::SELL_LIST, ready_at);
                }
            }
            (names::SELL_LIST, opcodes::OPEN_ITEM_MENU) => {
                if state.ignored_opens > 0 {
                    state.ignored_opens -= 1;
                    debug!("Swallowed item menu open {}", event);
                    return;
                }
                let index = event.int(1).and_then(|i| usize::try_from(i).ok());
                if let Some(index) = index.filter(|i| *i < state.items.len()) {
                    state.selected = Some(index);
                    state.open(names::CONTEXT_MENU, ready_at);
                }
            }
            (names::CONTEXT_MENU, opcodes::SELECT) => {
                state.close(names::CONTEXT_MENU);
                state.pending_price = None;
                state.open(names::PRICE_EDITOR, ready_at);
            }
            (names::PRICE_EDITOR, opcodes::COMPARE_PRICES) => {
                state.open(names::SEARCH_RESULTS, ready_at);
                let id = event.int(0).and_then(|id| u64::try_from(id).ok());
                let item = state.selected.and_then(|i| state.items.get(i));
                if let (Some(id), Some(item)) = (id, item) {
                    if let SimQuote::Respond(listings) = &item.quote {
                        let due = now + self.script.quote_latency;
                        let listings = listings.clone();
                        state.pending_quotes.push((due, CorrelationId(id), listings));
                    }
                }
            }
            (names::PRICE_EDITOR, opcodes::SET_PRICE) => {
                state.pending_price = event.int(0).and_then(|v| u32::try_from(v).ok());
            }
            (names::PRICE_EDITOR, opcodes::ADVANCE) => {
                if let Some(index) = state.selected.take() {
                    let pending = state.pending_price.take();
                    if let Some(item) = state.items.get_mut(index) {
                        let price = pending.unwrap_or(item.price);
                        let changed = price != item.price;
                        item.price = price;
                        state.confirmations.push(Confirmation {
                            index,
                            price,
                            changed,
                        });
                    }
                }
                state.close(names::PRICE_EDITOR);
                let last = state.confirmations.last().map(|c| c.index + 1);
                if self.script.drops_sell_list && last == Some(state.items.len()) {
                    debug!("Sell list closed by the host");
                    state.close(names::SELL_LIST);
                }
            }
            (names::SEARCH_RESULTS, opcodes::DISMISS) => state.close(names::SEARCH_RESULTS),
            _ => debug!("{} ignored {}", name, event),
        }
    }
}

impl SurfaceProbe for SimulatedEnvironment {
    fn exists(&self, name: &str) -> bool {
        self.is_open(name)
    }

    fn is_ready(&self, name: &str) -> bool {
        let now = self.clock.now();
        self.state().is_ready(name, now)
    }

    fn send(&self, name: &str, event: SurfaceEvent) -> anyhow::Result<()> {
        if self.script.failing_surface == Some(name) {
            anyhow::bail!("{} rejected event {}", name, event);
        }

        let now = self.clock.now();
        let mut state = self.state();
        state.events.push(SentEvent {
            surface: name.to_string(),
            event: event.clone(),
        });
        if !state.is_ready(name, now) {
            debug!("{} not ready, dropping {}", name, event);
            return Ok(());
        }
        self.react(&mut state, name, &event, now);
        Ok(())
    }

    fn close(&self, name: &str) -> anyhow::Result<()> {
        if self.script.failing_surface == Some(name) {
            anyhow::bail!("{} refused to close", name);
        }

        let now = self.clock.now();
        let mut state = self.state();
        state.close(name);
        if name == names::SELL_LIST {
            state.leaving = true;
            if self.script.quit_menu {
                let ready_at = self.ready_at(now);
                state.open(names::SELECT_STRING, ready_at);
            }
        }
        Ok(())
    }

    fn item_count(&self, name: &str) -> Option<usize> {
        let state = self.state();
        if name == names::SELL_LIST && state.open.contains_key(name) {
            Some(state.items.len())
        } else {
            None
        }
    }

    fn label(&self, name: &str) -> Option<String> {
        let state = self.state();
        if name != names::PRICE_EDITOR || !state.open.contains_key(name) {
            return None;
        }
        state
            .selected
            .and_then(|i| state.items.get(i))
            .map(|item| item.label.clone())
    }

    fn entries(&self, name: &str) -> Vec<String> {
        let state = self.state();
        if !state.open.contains_key(name) {
            return Vec::new();
        }
        match name {
            names::RETAINER_LIST => self.script.retainers.clone(),
            names::SELECT_STRING if state.leaving && self.script.empty_quit_menu => Vec::new(),
            names::SELECT_STRING => MENU_ENTRIES.iter().map(|e| e.to_string()).collect(),
            _ => Vec::new(),
        }
    }
}

impl IdentitySource for SimulatedEnvironment {
    fn own_identities(&self) -> Vec<String> {
        self.script.own_identities.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::quote::quote_channel;

    #[test]
    fn test_surfaces_become_ready_after_latency() {
        let clock = ManualClock::new();
        let (feed, _inbox) = quote_channel();
        let env = SimulatedEnvironment::new(
            SimScript::at_retainer_list(&["Alice"], vec![]),
            Arc::new(clock.clone()),
            feed,
        );

        assert!(env.is_ready(names::RETAINER_LIST));
        env.send(names::RETAINER_LIST, SurfaceEvent::new(opcodes::SELECT).with(0i64))
            .unwrap();
        assert!(!env.exists(names::RETAINER_LIST));
        assert!(env.exists(names::TALK));
        assert!(!env.is_ready(names::TALK));

        clock.advance(Duration::from_millis(100));
        assert!(env.is_ready(names::TALK));
    }

    #[test]
    fn test_quote_delivered_after_latency() {
        let clock = ManualClock::new();
        let (feed, mut inbox) = quote_channel();
        let env = SimulatedEnvironment::new(
            SimScript::at_sell_list(vec![SimItem::responding(
                "Iron Ingot",
                100,
                vec![Listing::new(90, false, "Other")],
            )]),
            Arc::new(clock.clone()),
            feed,
        );

        let open = SurfaceEvent::new(opcodes::OPEN_ITEM_MENU)
            .with(0i64)
            .with(0i64)
            .with(1i64);
        env.send(names::SELL_LIST, open).unwrap();
        clock.advance(Duration::from_millis(100));
        env.send(names::CONTEXT_MENU, SurfaceEvent::new(opcodes::SELECT)).unwrap();
        clock.advance(Duration::from_millis(100));
        assert_eq!(env.label(names::PRICE_EDITOR).as_deref(), Some("Iron Ingot"));

        env.send(
            names::PRICE_EDITOR,
            SurfaceEvent::new(opcodes::COMPARE_PRICES).with(7i64),
        )
        .unwrap();
        assert_eq!(env.pump(), 0);
        clock.advance(Duration::from_millis(300));
        assert_eq!(env.pump(), 1);

        let batches = inbox.drain();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].correlation_id, CorrelationId(7));
    }

    #[test]
    fn test_swallowed_sell_select_keeps_menu_open() {
        let clock = ManualClock::new();
        let (feed, _inbox) = quote_channel();
        let env = SimulatedEnvironment::new(
            SimScript::at_retainer_list(&["Alice"], vec![])
                .without_greeting()
                .ignoring_sell_selects(1),
            Arc::new(clock.clone()),
            feed,
        );
        env.send(names::RETAINER_LIST, SurfaceEvent::new(opcodes::SELECT).with(0i64))
            .unwrap();
        clock.advance(Duration::from_millis(100));

        let sell = SurfaceEvent::new(opcodes::SELECT).with(SELL_OPTION).with(0i64);
        env.send(names::SELECT_STRING, sell.clone()).unwrap();
        assert!(env.is_ready(names::SELECT_STRING));
        assert!(!env.exists(names::SELL_LIST));

        env.send(names::SELECT_STRING, sell).unwrap();
        assert!(env.exists(names::SELL_LIST));
    }

    #[test]
    fn test_closing_sell_list_without_quit_menu() {
        let clock = ManualClock::new();
        let (feed, _inbox) = quote_channel();
        let env = SimulatedEnvironment::new(
            SimScript::at_sell_list(vec![]).without_quit_menu(),
            Arc::new(clock.clone()),
            feed,
        );
        env.close(names::SELL_LIST).unwrap();
        clock.advance(Duration::from_millis(500));
        assert!(!env.exists(names::SELL_LIST));
        assert!(!env.exists(names::SELECT_STRING));
    }

    #[test]
    fn test_failing_surface_faults() {
        let clock = ManualClock::new();
        let (feed, _inbox) = quote_channel();
        let env = SimulatedEnvironment::new(
            SimScript::at_sell_list(vec![]).failing(names::SELL_LIST),
            Arc::new(clock),
            feed,
        );
        assert!(env.send(names::SELL_LIST, SurfaceEvent::new(0)).is_err());
        assert!(env.close(names::SELL_LIST).is_err());
    }
}

//! Surface Probe - boundary to the external environment
//!
//! The controller never touches the environment directly. It polls surfaces
//! by name and fires structured events at them; everything behind this trait
//! is owned by the host.

use std::fmt;

/// Names of the surfaces the workflow walks through
pub mod names {
    /// Origin surface listing the retainers
    pub const RETAINER_LIST: &str = "RetainerList";
    /// Free-text dialogue box
    pub const TALK: &str = "Talk";
    /// Option menu (retainer menu, quit prompt)
    pub const SELECT_STRING: &str = "SelectString";
    /// Items the retainer has on the market
    pub const SELL_LIST: &str = "RetainerSellList";
    pub const CONTEXT_MENU: &str = "ContextMenu";
    /// Price editor for a single item
    pub const PRICE_EDITOR: &str = "RetainerSell";
    /// Market board search results opened by a price comparison
    pub const SEARCH_RESULTS: &str = "ItemSearchResult";
}

/// Opcodes understood by the surfaces
pub mod opcodes {
    /// Click through a dialogue / confirm an editor
    pub const ADVANCE: i64 = 0;
    /// Pick an entry of an option list
    pub const SELECT: i64 = 0;
    /// Alternative select used when the context menu ignores `SELECT`
    pub const SELECT_ALT: i64 = 1;
    /// Open the context menu of a sell list entry
    pub const OPEN_ITEM_MENU: i64 = 3;
    /// Write a numeric value into the price editor
    pub const SET_PRICE: i64 = 3;
    /// Ask the market for current listings ("compare prices")
    pub const COMPARE_PRICES: i64 = 4;
    /// Close a surface via its own callback
    pub const DISMISS: i64 = -1;
}

/// Glyph the environment prefixes to premium item names
pub const PREMIUM_GLYPH: char = '\u{E03C}';

/// A single event parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventParam {
    Int(i64),
    Str(String),
}

impl From<i64> for EventParam {
    fn from(value: i64) -> Self {
        EventParam::Int(value)
    }
}

impl From<&str> for EventParam {
    fn from(value: &str) -> Self {
        EventParam::Str(value.to_string())
    }
}

impl fmt::Display for EventParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventParam::Int(v) => write!(f, "{}", v),
            EventParam::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// Structured command sent to a surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceEvent {
    pub opcode: i64,
    pub params: Vec<EventParam>,
}

impl SurfaceEvent {
    pub fn new(opcode: i64) -> Self {
        Self {
            opcode,
            params: Vec::new(),
        }
    }

    pub fn with(mut self, param: impl Into<EventParam>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Integer parameter at `index`, if any
    pub fn int(&self, index: usize) -> Option<i64> {
        match self.params.get(index) {
            Some(EventParam::Int(v)) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for SurfaceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(|p| p.to_string()).collect();
        write!(f, "{}[{}]", self.opcode, params.join(", "))
    }
}

/// Non-blocking view of the environment.
///
/// All queries must return immediately. `send` and `close` are fire-and-forget:
/// `Ok` means the event was dispatched, not that it had any effect. An `Err`
/// means the environment faulted while dispatching.
pub trait SurfaceProbe: Send + Sync {
    /// Surface is present, whether or not it finished loading
    fn exists(&self, name: &str) -> bool;

    /// Surface is visible and fully loaded
    fn is_ready(&self, name: &str) -> bool;

    fn send(&self, name: &str, event: SurfaceEvent) -> anyhow::Result<()>;

    fn close(&self, name: &str) -> anyhow::Result<()>;

    /// Number of entries a list surface currently holds
    fn item_count(&self, name: &str) -> Option<usize>;

    /// Displayed title/label of a surface
    fn label(&self, name: &str) -> Option<String>;

    /// Entry texts of an option or name list
    fn entries(&self, name: &str) -> Vec<String>;
}

/// Source of the player's own seller identities
pub trait IdentitySource: Send + Sync {
    fn own_identities(&self) -> Vec<String>;
}

/// Fixed identity list
#[derive(Debug, Clone, Default)]
pub struct StaticIdentities(pub Vec<String>);

impl IdentitySource for StaticIdentities {
    fn own_identities(&self) -> Vec<String> {
        self.0.clone()
    }
}

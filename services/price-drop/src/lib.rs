//! Price Drop Library
//!
//! Retainer price drop automation: a tick-driven controller that walks the
//! market surfaces, correlates quote batches with its own requests and
//! undercuts the lowest competing price.

pub mod clock;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod monitor;
pub mod pricing;
pub mod quote;
pub mod records;
pub mod sim;
pub mod state;
pub mod surface;

// Re-export main types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{MonitorConfig, Settings, TimeoutConfig};
pub use controller::{
    AutomationController, Collaborators, ItemReport, RunContext, RunEnd, RunReport, RunTarget,
    TickOutcome,
};
pub use error::{AutomationError, StartRejected};
pub use monitor::{ListingMonitor, MonitorOutcome, PriceSink};
pub use pricing::{OwnIdentities, PriceResolution, QualityTier, SellingContext};
pub use quote::{quote_channel, CorrelationId, Listing, ListingBatch, QuoteFeed, QuoteInbox};
pub use records::{eligibility, Eligibility, JsonRunRecordStore, MemoryRunRecords, RunRecordSink};
pub use state::AutomationState;
pub use surface::{IdentitySource, StaticIdentities, SurfaceEvent, SurfaceProbe};

#[cfg(test)]
mod tests;

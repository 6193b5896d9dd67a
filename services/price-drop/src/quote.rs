//! Quote correlation
//!
//! Quote queries are fired through a surface and answered later, out of band,
//! by the host's market feed. The feed only ever posts batches into a channel;
//! the controller drains it on its own tick and decides, against the single
//! outstanding request, whether a batch is accepted or dropped.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Identifier pairing a quote query with its eventual batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// One competing listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub price_per_unit: u32,
    pub premium: bool,
    /// Seller (retainer) name as shown by the market
    pub seller: String,
}

impl Listing {
    pub fn new(price_per_unit: u32, premium: bool, seller: &str) -> Self {
        Self {
            price_per_unit,
            premium,
            seller: seller.to_string(),
        }
    }
}

/// A delivery from the quote feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingBatch {
    pub correlation_id: CorrelationId,
    pub listings: Vec<Listing>,
}

/// Sending half handed to the host; register it once as the batch handler.
///
/// Cheap to clone and safe to call from any thread.
#[derive(Debug, Clone)]
pub struct QuoteFeed {
    tx: mpsc::UnboundedSender<ListingBatch>,
}

impl QuoteFeed {
    /// Post a delivered batch. Returns `false` once the inbox is gone.
    pub fn deliver(&self, correlation_id: CorrelationId, listings: Vec<Listing>) -> bool {
        let batch = ListingBatch {
            correlation_id,
            listings,
        };
        match self.tx.send(batch) {
            Ok(()) => true,
            Err(_) => {
                debug!("Quote inbox closed, dropping batch {}", correlation_id);
                false
            }
        }
    }
}

/// Receiving half owned by the controller
#[derive(Debug)]
pub struct QuoteInbox {
    rx: mpsc::UnboundedReceiver<ListingBatch>,
}

impl QuoteInbox {
    /// Take everything delivered since the last drain, without waiting
    pub fn drain(&mut self) -> Vec<ListingBatch> {
        let mut batches = Vec::new();
        while let Ok(batch) = self.rx.try_recv() {
            batches.push(batch);
        }
        batches
    }
}

/// Create a connected feed/inbox pair
pub fn quote_channel() -> (QuoteFeed, QuoteInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QuoteFeed { tx }, QuoteInbox { rx })
}

/// An issued quote query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuoteRequest {
    pub id: CorrelationId,
    pub issued_at: Instant,
}

impl QuoteRequest {
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.issued_at) > timeout
    }
}

/// Why a batch was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Nothing outstanding (idle, stopped, or already resolved)
    Unsolicited,
    /// Belongs to a superseded or unknown request
    Stale { outstanding: CorrelationId },
}

/// Tracks the single outstanding quote request
#[derive(Debug)]
pub struct QuoteCorrelator {
    next_id: u64,
    outstanding: Option<QuoteRequest>,
    last_consumed: Option<CorrelationId>,
}

impl QuoteCorrelator {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            outstanding: None,
            last_consumed: None,
        }
    }

    /// Issue a fresh request, superseding any prior one
    pub fn issue(&mut self, now: Instant) -> QuoteRequest {
        let request = QuoteRequest {
            id: CorrelationId(self.next_id),
            issued_at: now,
        };
        self.next_id += 1;

        if let Some(prior) = self.outstanding.replace(request) {
            debug!("Quote request {} superseded by {}", prior.id, request.id);
        }
        request
    }

    pub fn outstanding(&self) -> Option<&QuoteRequest> {
        self.outstanding.as_ref()
    }

    pub fn last_consumed(&self) -> Option<CorrelationId> {
        self.last_consumed
    }

    /// Check a batch against the outstanding request and clear it on match.
    ///
    /// Check and clear happen in one step, so a batch can be consumed at most once.
    pub fn accept(&mut self, batch: ListingBatch) -> Result<ListingBatch, Rejection> {
        match self.outstanding {
            Some(request) if request.id == batch.correlation_id => {
                self.outstanding = None;
                self.last_consumed = Some(batch.correlation_id);
                Ok(batch)
            }
            Some(request) => Err(Rejection::Stale {
                outstanding: request.id,
            }),
            None => Err(Rejection::Unsolicited),
        }
    }

    /// Drop interest in the outstanding request, returning it if there was one
    pub fn abandon(&mut self) -> Option<QuoteRequest> {
        let abandoned = self.outstanding.take();
        if let Some(request) = &abandoned {
            warn!("Abandoned quote request {}", request.id);
        }
        abandoned
    }
}

impl Default for QuoteCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(id: u64, prices: &[u32]) -> ListingBatch {
        ListingBatch {
            correlation_id: CorrelationId(id),
            listings: prices
                .iter()
                .map(|p| Listing::new(*p, false, "Other"))
                .collect(),
        }
    }

    #[test]
    fn test_ids_are_monotonic_and_never_reused() {
        let mut correlator = QuoteCorrelator::new();
        let now = Instant::now();

        let first = correlator.issue(now);
        correlator.abandon();
        let second = correlator.issue(now);
        let third = correlator.issue(now);

        assert!(first.id < second.id);
        assert!(second.id < third.id);
    }

    #[test]
    fn test_accept_matching_batch_once() {
        let mut correlator = QuoteCorrelator::new();
        let request = correlator.issue(Instant::now());

        let accepted = correlator.accept(batch(request.id.0, &[500])).unwrap();
        assert_eq!(accepted.listings.len(), 1);
        assert!(correlator.outstanding().is_none());
        assert_eq!(correlator.last_consumed(), Some(request.id));

        // Duplicate delivery of the same id is dropped
        assert_eq!(
            correlator.accept(batch(request.id.0, &[400])),
            Err(Rejection::Unsolicited)
        );
    }

    #[test]
    fn test_superseded_request_is_stale() {
        let mut correlator = QuoteCorrelator::new();
        let old = correlator.issue(Instant::now());
        let new = correlator.issue(Instant::now());

        assert_eq!(
            correlator.accept(batch(old.id.0, &[100])),
            Err(Rejection::Stale { outstanding: new.id })
        );
        // Still waiting on the newest request
        assert_eq!(correlator.outstanding().map(|r| r.id), Some(new.id));
        assert!(correlator.accept(batch(new.id.0, &[100])).is_ok());
    }

    #[test]
    fn test_request_expiry() {
        let now = Instant::now();
        let request = QuoteRequest {
            id: CorrelationId(1),
            issued_at: now,
        };
        assert!(!request.is_expired(now + Duration::from_secs(3), Duration::from_secs(3)));
        assert!(request.is_expired(now + Duration::from_millis(3001), Duration::from_secs(3)));
    }

    #[test]
    fn test_channel_drain() {
        let (feed, mut inbox) = quote_channel();
        assert!(feed.deliver(CorrelationId(1), vec![]));
        assert!(feed.clone().deliver(CorrelationId(2), vec![]));

        let drained = inbox.drain();
        assert_eq!(drained.len(), 2);
        assert!(inbox.drain().is_empty());

        drop(inbox);
        assert!(!feed.deliver(CorrelationId(3), vec![]));
    }
}

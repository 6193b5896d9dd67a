//! Price Correlator - lowest competing price and undercut arithmetic

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::quote::Listing;
use crate::surface::PREMIUM_GLYPH;

/// Quality tier of the item being sold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    #[default]
    Standard,
    Premium,
}

impl QualityTier {
    /// Classify an item from the name shown in the price editor
    pub fn from_label(label: &str) -> Self {
        if label.contains(PREMIUM_GLYPH) {
            QualityTier::Premium
        } else {
            QualityTier::Standard
        }
    }

    pub fn short(&self) -> &'static str {
        match self {
            QualityTier::Standard => "NQ",
            QualityTier::Premium => "HQ",
        }
    }
}

/// Normalized set of the caller's own seller names
#[derive(Debug, Clone, Default)]
pub struct OwnIdentities {
    names: HashSet<String>,
}

impl OwnIdentities {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = names
            .into_iter()
            .map(|n| normalize_own_name(n.as_ref()))
            .filter(|n| !n.is_empty())
            .collect();
        Self { names }
    }

    /// Whether a listing's seller is one of ours
    pub fn contains(&self, seller: &str) -> bool {
        self.names.contains(&seller.trim().to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Own names may carry a server-side suffix after `=`; only the part before it
/// is compared, trimmed and case-insensitively.
fn normalize_own_name(name: &str) -> String {
    let name = name.split('\0').next().unwrap_or_default();
    let name = match name.find('=') {
        Some(pos) => &name[..pos],
        None => name,
    };
    name.trim().to_lowercase()
}

/// What is being sold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SellingContext {
    pub tier: QualityTier,
}

/// Outcome of resolving a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriceResolution {
    Lowest {
        price: u32,
        premium: bool,
        seller: String,
    },
    NoData,
}

impl PriceResolution {
    pub fn price(&self) -> Option<u32> {
        match self {
            PriceResolution::Lowest { price, .. } => Some(*price),
            PriceResolution::NoData => None,
        }
    }
}

/// Lowest applicable competing price.
///
/// Own listings never count. When selling premium, only premium listings count
/// unless there are none, in which case every remaining listing does.
pub fn resolve(
    listings: &[Listing],
    context: &SellingContext,
    own: &OwnIdentities,
) -> PriceResolution {
    let competing: Vec<&Listing> = listings
        .iter()
        .filter(|l| {
            let ours = own.contains(&l.seller);
            if ours {
                debug!("Skipped own listing: {} at {}", l.seller, l.price_per_unit);
            }
            !ours
        })
        .collect();

    let candidates: Vec<&Listing> = match context.tier {
        QualityTier::Premium => {
            let premium: Vec<&Listing> = competing.iter().copied().filter(|l| l.premium).collect();
            if premium.is_empty() {
                debug!("No premium listings, using lowest of any quality");
                competing
            } else {
                premium
            }
        }
        QualityTier::Standard => competing,
    };

    match candidates.into_iter().min_by_key(|l| l.price_per_unit) {
        Some(lowest) => PriceResolution::Lowest {
            price: lowest.price_per_unit,
            premium: lowest.premium,
            seller: lowest.seller.clone(),
        },
        None => PriceResolution::NoData,
    }
}

/// `max(1, lowest - offset)`
pub fn undercut(lowest: u32, offset: u32) -> u32 {
    lowest.saturating_sub(offset).max(1)
}

/// Suppresses repeated action on the same item within a short window.
///
/// Independent of correlation ids: used where batches cannot be tied to a
/// request, so several batches for one query look alike.
#[derive(Debug, Clone)]
pub struct ProcessedGuard {
    item_window: Duration,
    global_window: Duration,
    processed: HashMap<String, Instant>,
    last_action: Option<Instant>,
}

impl ProcessedGuard {
    pub fn new(item_window: Duration, global_window: Duration) -> Self {
        Self {
            item_window,
            global_window,
            processed: HashMap::new(),
            last_action: None,
        }
    }

    /// Whether `item` may be acted on at `now`
    pub fn should_process(&self, item: &str, now: Instant) -> bool {
        if let Some(last) = self.last_action {
            if now.saturating_duration_since(last) < self.global_window {
                return false;
            }
        }
        match self.processed.get(item) {
            Some(at) => now.saturating_duration_since(*at) >= self.item_window,
            None => true,
        }
    }

    pub fn mark(&mut self, item: &str, now: Instant) {
        let window = self.item_window;
        self.processed
            .retain(|_, at| now.saturating_duration_since(*at) < window);
        self.processed.insert(item.to_string(), now);
        self.last_action = Some(now);
    }

    /// Forget an item, e.g. when its editor closes
    pub fn forget(&mut self, item: &str) {
        self.processed.remove(item);
    }
}

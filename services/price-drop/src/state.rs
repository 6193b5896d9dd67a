//! Automation states and their transition table

use serde::{Deserialize, Serialize};

/// Controller step. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationState {
    Idle,

    // Retainer selection and menu navigation
    SelectingRetainer,
    WaitingForDialogue,
    DismissingDialogue,
    WaitingForMenu,
    SelectingSellItems,
    WaitingForSellList,

    // Per-item cycle
    GettingItemData,
    OpeningItemMenu,
    WaitingForContextMenu,
    SelectingAdjustPrice,
    WaitingForPriceEditor,
    RequestingQuotes,
    WaitingForQuotes,
    ClosingSearchResults,
    SettingPrice,
    ConfirmingPrice,
    NextItem,

    Finished,

    // Unwind
    ClosingSellList,
    SelectingQuit,
    WaitingForDismissal,
    WaitingForRetainerList,
}

use AutomationState::*;

impl AutomationState {
    pub const ALL: [AutomationState; 23] = [
        Idle,
        SelectingRetainer,
        WaitingForDialogue,
        DismissingDialogue,
        WaitingForMenu,
        SelectingSellItems,
        WaitingForSellList,
        GettingItemData,
        OpeningItemMenu,
        WaitingForContextMenu,
        SelectingAdjustPrice,
        WaitingForPriceEditor,
        RequestingQuotes,
        WaitingForQuotes,
        ClosingSearchResults,
        SettingPrice,
        ConfirmingPrice,
        NextItem,
        Finished,
        ClosingSellList,
        SelectingQuit,
        WaitingForDismissal,
        WaitingForRetainerList,
    ];

    /// States reachable from `self` in one step, besides `Idle`
    pub fn successors(self) -> &'static [AutomationState] {
        match self {
            Idle => &[SelectingRetainer, GettingItemData],
            SelectingRetainer => &[WaitingForDialogue],
            WaitingForDialogue => &[DismissingDialogue, SelectingSellItems],
            DismissingDialogue => &[WaitingForMenu],
            WaitingForMenu => &[SelectingSellItems],
            SelectingSellItems => &[WaitingForSellList],
            WaitingForSellList => &[GettingItemData, SelectingSellItems],
            GettingItemData => &[OpeningItemMenu, Finished],
            OpeningItemMenu => &[WaitingForContextMenu, Finished],
            WaitingForContextMenu => &[SelectingAdjustPrice, OpeningItemMenu],
            SelectingAdjustPrice => &[WaitingForPriceEditor],
            WaitingForPriceEditor => &[RequestingQuotes, OpeningItemMenu],
            RequestingQuotes => &[WaitingForQuotes],
            WaitingForQuotes => &[ClosingSearchResults],
            ClosingSearchResults => &[SettingPrice],
            SettingPrice => &[ConfirmingPrice],
            ConfirmingPrice => &[NextItem],
            NextItem => &[GettingItemData, Finished],
            Finished => &[ClosingSellList],
            ClosingSellList => &[SelectingQuit],
            SelectingQuit => &[WaitingForDismissal, WaitingForRetainerList],
            WaitingForDismissal => &[WaitingForRetainerList],
            WaitingForRetainerList => &[],
        }
    }

    /// Every run may end in `Idle` (finish, abort, stop, fault)
    pub fn can_transition(self, to: AutomationState) -> bool {
        to == Idle || self.successors().contains(&to)
    }

    pub fn is_idle(self) -> bool {
        self == Idle
    }

    /// Part of the per-item cycle
    pub fn is_item_cycle(self) -> bool {
        matches!(
            self,
            GettingItemData
                | OpeningItemMenu
                | WaitingForContextMenu
                | SelectingAdjustPrice
                | WaitingForPriceEditor
                | RequestingQuotes
                | WaitingForQuotes
                | ClosingSearchResults
                | SettingPrice
                | ConfirmingPrice
                | NextItem
        )
    }

    /// Part of the teardown after `Finished`
    pub fn is_unwinding(self) -> bool {
        matches!(
            self,
            ClosingSellList | SelectingQuit | WaitingForDismissal | WaitingForRetainerList
        )
    }
}

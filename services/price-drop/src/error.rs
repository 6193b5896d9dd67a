//! Error types for the automation controller

use std::time::Duration;

use crate::state::AutomationState;

/// Why `start` refused to begin a run
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartRejected {
    #[error("Automation already running ({0:?})")]
    AlreadyRunning(AutomationState),

    #[error("{surface} not open")]
    SurfaceNotReady { surface: &'static str },
}

/// Fault raised while evaluating a tick. The run is abandoned when one occurs.
#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    #[error("{surface} did not become ready within {waited:?} ({state:?})")]
    Timeout {
        state: AutomationState,
        surface: &'static str,
        waited: Duration,
    },

    #[error("Run aborted: {0}")]
    Aborted(String),

    #[error("Illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: AutomationState,
        to: AutomationState,
    },

    #[error("Surface {surface} fault: {source:#}")]
    Surface {
        surface: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl AutomationError {
    pub fn surface(surface: &'static str, source: anyhow::Error) -> Self {
        AutomationError::Surface { surface, source }
    }

    /// Timeouts and aborts end a run deliberately; everything else is a fault
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            AutomationError::IllegalTransition { .. } | AutomationError::Surface { .. }
        )
    }
}

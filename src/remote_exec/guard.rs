use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq)]
enum GuardState {
    Cancelled(String),
    Started,
}

/// Decides the race between cancelling an action and dispatching it for execution.
///
/// The cell is set exactly once. Whoever sets it first wins: once `Started`, the action is
/// past its point of no return and later cancellations are ignored; once `Cancelled`, the
/// action must not be sent to the executor.
#[derive(Debug, Default)]
pub struct CancellationGuard {
    state: OnceLock<GuardState>,
}

impl CancellationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Returns `true` if this call decided the outcome.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.state.set(GuardState::Cancelled(reason.into())).is_ok()
    }

    /// Cancels unless the action already started. Returns `true` when the action is
    /// cancelled and will not run, whichever call cancelled it.
    pub fn cancel_if_not_started(&self, reason: impl Into<String>) -> bool {
        self.cancel(reason);
        self.is_cancelled()
    }

    /// Crosses the point of no return, unless a cancellation got there first.
    pub fn try_start(&self) -> Result<(), String> {
        let _ = self.state.set(GuardState::Started);
        match self.state.get() {
            Some(GuardState::Cancelled(reason)) => Err(reason.clone()),
            _ => Ok(()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.state.get(), Some(GuardState::Cancelled(_)))
    }

    pub fn has_started(&self) -> bool {
        matches!(self.state.get(), Some(GuardState::Started))
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        match self.state.get() {
            Some(GuardState::Cancelled(reason)) => Some(reason),
            _ => None,
        }
    }
}

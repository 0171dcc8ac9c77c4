//! Cooperative interruption

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What the requester wants done with an interrupted job
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InterruptLevel {
    /// Put the job back in the queue for a later attempt
    Retry = 1,
    /// Drop the job
    Cancel = 2,
}

impl InterruptLevel {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Retry),
            2 => Some(Self::Cancel),
            _ => None,
        }
    }
}

impl std::fmt::Display for InterruptLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Cancel => write!(f, "cancel"),
        }
    }
}

/// Shared interrupt flag for one running job
///
/// Requesting an interrupt never stops a running processor by itself; the
/// processor polls [`InterruptHandle::requested`] at safe points. A cancel
/// request overrides an earlier retry request, never the other way round.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    level: Arc<AtomicU8>,
    token: CancellationToken,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, level: InterruptLevel) {
        self.level.fetch_max(level as u8, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn requested(&self) -> Option<InterruptLevel> {
        InterruptLevel::from_u8(self.level.load(Ordering::SeqCst))
    }

    pub fn is_requested(&self) -> bool {
        self.requested().is_some()
    }

    /// Resolves once any interrupt has been requested
    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    /// Token for handing to code that already speaks `tokio-util`
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

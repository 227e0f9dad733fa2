//! Cancellation: a flag the Ctrl-C handler sets and backend calls observe.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cloneable cancellation flag.
///
/// All clones share one flag. [`Cancellation::never`] yields a token that can
/// never fire, used for compensating calls that must run to completion.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Option<Arc<AtomicBool>>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self {
            flag: Some(Arc::new(AtomicBool::new(false))),
        }
    }

    pub fn never() -> Self {
        Self { flag: None }
    }

    /// Request cancellation. No-op on a [`Cancellation::never`] token.
    pub fn cancel(&self) {
        if let Some(flag) = &self.flag {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, error};
use tsbridge_transport::adapter::DisconnectReason;

use crate::critical::{enter_critical_section, notify_all};

/// Unrecoverable transport condition. No reconnect is attempted after one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("connect to {broker} failed (topic {topic}, client {client_id}): {cause}")]
    ConnectFailed {
        topic: String,
        client_id: String,
        broker: String,
        cause: String,
    },
    #[error("subscribe failed (topic {topic}, client {client_id}): {cause}")]
    SubscribeFailed {
        topic: String,
        client_id: String,
        cause: String,
    },
    #[error("connection lost (topic {topic}, client {client_id}): {cause}")]
    ConnectionLost {
        topic: String,
        client_id: String,
        cause: String,
    },
    #[error("disconnected by broker (topic {topic}, client {client_id}): {reason}")]
    Disconnected {
        topic: String,
        client_id: String,
        reason: DisconnectReason,
    },
}

impl FatalError {
    pub fn topic(&self) -> &str {
        match self {
            FatalError::ConnectFailed { topic, .. }
            | FatalError::SubscribeFailed { topic, .. }
            | FatalError::ConnectionLost { topic, .. }
            | FatalError::Disconnected { topic, .. } => topic,
        }
    }

    pub fn client_id(&self) -> &str {
        match self {
            FatalError::ConnectFailed { client_id, .. }
            | FatalError::SubscribeFailed { client_id, .. }
            | FatalError::ConnectionLost { client_id, .. }
            | FatalError::Disconnected { client_id, .. } => client_id,
        }
    }
}

/// Callback run once, on the first fatal error. Binaries use it to exit.
pub type FatalHook = Arc<dyn Fn(&FatalError) + Send + Sync>;

#[derive(Default)]
struct FatalInner {
    first: Mutex<Option<FatalError>>,
    hook: Option<FatalHook>,
}

/// Shared sink for fatal errors raised by publishers and subscribers.
///
/// The first error is kept and later ones are only logged at debug level.
/// Cloning shares the signal.
#[derive(Clone, Default)]
pub struct FatalSignal {
    inner: Arc<FatalInner>,
}

impl fmt::Debug for FatalSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FatalSignal")
            .field("raised", &self.get())
            .field("hook", &self.inner.hook.is_some())
            .finish()
    }
}

impl FatalSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(hook: FatalHook) -> Self {
        Self {
            inner: Arc::new(FatalInner {
                first: Mutex::new(None),
                hook: Some(hook),
            }),
        }
    }

    /// Records `err`. Returns `true` if it was the first fatal error.
    ///
    /// Enters the critical section, so callers must not hold it.
    pub fn raise(&self, err: FatalError) -> bool {
        {
            let mut first = self.inner.first.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = first.as_ref() {
                debug!(first = %existing, later = %err, "ignoring fatal error after the first");
                return false;
            }
            error!(topic = %err.topic(), client_id = %err.client_id(), "fatal: {err}");
            *first = Some(err.clone());
        }
        {
            // Gate waiters test the flag while holding the section.
            let _section = enter_critical_section();
            notify_all();
        }
        if let Some(hook) = &self.inner.hook {
            hook(&err);
        }
        true
    }

    pub fn get(&self) -> Option<FatalError> {
        self.inner
            .first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_raised(&self) -> bool {
        self.inner
            .first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

//! State change notifications
//!
//! Sub-watchers only enqueue the kind of change; the runner task builds a
//! fresh snapshot and invokes callbacks on its own schedule, so a slow
//! callback never stalls the watch streams. At most one notification per kind
//! is pending at a time; further changes of that kind are coalesced into it.

use interfero::k8s::PodMeta;
use k8s_openapi::api::core::v1::Node;
use log::{debug, info};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterType {
    NodeUpdate,
    AllPods,
}

impl RegisterType {
    pub const ALL: [RegisterType; 2] = [RegisterType::NodeUpdate, RegisterType::AllPods];

    const fn index(&self) -> usize {
        match self {
            RegisterType::NodeUpdate => 0,
            RegisterType::AllPods => 1,
        }
    }
}

impl fmt::Display for RegisterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterType::NodeUpdate => f.write_str("NodeUpdate"),
            RegisterType::AllPods => f.write_str("AllPods"),
        }
    }
}

/// Informer state handed to callbacks
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub node: Option<Arc<Node>>,
    pub pods: Vec<Arc<PodMeta>>,
}

pub type UpdateCallback = Arc<dyn Fn(RegisterType, &StateSnapshot) + Send + Sync>;

#[derive(Clone)]
struct CallbackEntry {
    name: String,
    description: String,
    callback: UpdateCallback,
}

pub struct CallbackRunner {
    callbacks: RwLock<HashMap<RegisterType, Vec<CallbackEntry>>>,
    pending: [AtomicBool; 2],
    tx: mpsc::Sender<RegisterType>,
    rx: Mutex<Option<mpsc::Receiver<RegisterType>>>,
}

impl CallbackRunner {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(RegisterType::ALL.len());
        Self {
            callbacks: RwLock::new(HashMap::new()),
            pending: [AtomicBool::new(false), AtomicBool::new(false)],
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn register(
        &self,
        kind: RegisterType,
        name: &str,
        description: &str,
        callback: UpdateCallback,
    ) {
        info!("Registered {} callback {}: {}", kind, name, description);
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(CallbackEntry {
                name: name.to_string(),
                description: description.to_string(),
                callback,
            });
    }

    pub fn callback_count(&self, kind: RegisterType) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Queue a notification without blocking the caller
    pub fn send_update(&self, kind: RegisterType) {
        if self.pending[kind.index()].swap(true, Ordering::AcqRel) {
            debug!("{} notification coalesced", kind);
            return;
        }
        if self.tx.try_send(kind).is_err() {
            // Only possible once the runner has gone away.
            self.pending[kind.index()].store(false, Ordering::Release);
        }
    }

    /// Dispatch queued notifications until `stop` fires.
    ///
    /// `snapshot` is evaluated once per notification, right before dispatch.
    pub async fn run<S>(&self, snapshot: S, stop: CancellationToken)
    where
        S: Fn() -> StateSnapshot,
    {
        let taken = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut rx) = taken else {
            debug!("Callback runner already started");
            return;
        };

        loop {
            let kind = tokio::select! {
                _ = stop.cancelled() => break,
                kind = rx.recv() => match kind {
                    Some(kind) => kind,
                    None => break,
                },
            };

            self.pending[kind.index()].store(false, Ordering::Release);
            let state = snapshot();
            self.dispatch(kind, &state);
        }

        debug!("Callback runner stopped");
    }

    /// Callbacks run outside the registry lock and may register more.
    fn dispatch(&self, kind: RegisterType, state: &StateSnapshot) {
        let entries = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        for entry in &entries {
            debug!(
                "Running {} callback {} ({})",
                kind, entry.name, entry.description
            );
            (entry.callback)(kind, state);
        }
    }
}

impl Default for CallbackRunner {
    fn default() -> Self {
        Self::new()
    }
}

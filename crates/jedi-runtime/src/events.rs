//! Process events and listener plumbing.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

use chrono::{DateTime, Utc};
use jedi_process_state::SpawnOutcome;
use serde::{Deserialize, Serialize};
use tracing::error;

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one facade, used as the event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(u64);

impl ProcessId {
    pub(crate) fn next() -> Self {
        Self(NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessEventKind {
    Completed,
    Interrupted,
}

/// Terminal notification for one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub source: ProcessId,
    pub kind: ProcessEventKind,
    /// OS pid, when the child got far enough to have one.
    pub pid: Option<u32>,
    /// Recorded outcome; always `None` for [`ProcessEventKind::Interrupted`].
    pub outcome: Option<SpawnOutcome>,
    pub timestamp: DateTime<Utc>,
}

impl ProcessEvent {
    pub fn completed(source: ProcessId, pid: Option<u32>, outcome: SpawnOutcome) -> Self {
        Self {
            source,
            kind: ProcessEventKind::Completed,
            pid,
            outcome: Some(outcome),
            timestamp: Utc::now(),
        }
    }

    pub fn interrupted(source: ProcessId, pid: Option<u32>) -> Self {
        Self {
            source,
            kind: ProcessEventKind::Interrupted,
            pid,
            outcome: None,
            timestamp: Utc::now(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.kind == ProcessEventKind::Completed
    }
}

/// Observer of terminal process events.
///
/// Called on the reaping worker while the process's listener set is locked:
/// a listener may query the process (wait, outcome) but must not add or
/// remove listeners on the same process from inside the callback.
pub trait ProcessEventListener: Send + Sync {
    fn handle_process_event(&self, event: &ProcessEvent);
}

impl<F> ProcessEventListener for F
where
    F: Fn(&ProcessEvent) + Send + Sync,
{
    fn handle_process_event(&self, event: &ProcessEvent) {
        self(event)
    }
}

/// Forwards events into an mpsc channel. Send errors (receiver gone) are
/// ignored.
pub(crate) struct ChannelListener(pub(crate) mpsc::Sender<ProcessEvent>);

impl ProcessEventListener for ChannelListener {
    fn handle_process_event(&self, event: &ProcessEvent) {
        let _ = self.0.send(event.clone());
    }
}

/// Handle returned by listener registration, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registered listeners of one process. Closed at the terminal transition;
/// a closed set accepts no new listeners.
#[derive(Default)]
pub(crate) struct ListenerSet {
    next_id: u64,
    listeners: Vec<(ListenerId, Arc<dyn ProcessEventListener>)>,
    closed: bool,
}

impl ListenerSet {
    /// Returns `None` once the set is closed.
    pub(crate) fn add(&mut self, listener: Arc<dyn ProcessEventListener>) -> Option<ListenerId> {
        if self.closed {
            return None;
        }
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.push((id, listener));
        Some(id)
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Deliver `event` to every listener, then clear and close the set.
    /// A panicking listener is logged and does not stop later deliveries.
    pub(crate) fn dispatch_and_close(&mut self, event: &ProcessEvent) {
        self.closed = true;
        for (id, listener) in self.listeners.drain(..) {
            let delivered =
                panic::catch_unwind(AssertUnwindSafe(|| listener.handle_process_event(event)));
            if delivered.is_err() {
                error!(
                    "Listener {:?} panicked handling {:?} from {}",
                    id, event.kind, event.source
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_process_ids_are_unique() {
        let a = ProcessId::next();
        let b = ProcessId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("proc-"));
    }

    #[test]
    fn test_dispatch_closes_set() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut set = ListenerSet::default();
        let counter = Arc::clone(&hits);
        set.add(Arc::new(move |_: &ProcessEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        let event = ProcessEvent::completed(ProcessId::next(), Some(10), SpawnOutcome::Exited(0));
        set.dispatch_and_close(&event);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 0);

        let late = set.add(Arc::new(|_: &ProcessEvent| {}));
        assert!(late.is_none());
    }

    #[test]
    fn test_panicking_listener_does_not_block_later_ones() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut set = ListenerSet::default();
        set.add(Arc::new(|_: &ProcessEvent| panic!("listener failed")))
            .unwrap();
        let counter = Arc::clone(&hits);
        set.add(Arc::new(move |_: &ProcessEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        let event = ProcessEvent::completed(ProcessId::next(), Some(10), SpawnOutcome::Exited(0));
        set.dispatch_and_close(&event);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_removed_listener_is_not_called() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut set = ListenerSet::default();
        let counter = Arc::clone(&hits);
        let id = set
            .add(Arc::new(move |_: &ProcessEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert!(set.remove(id));
        assert!(!set.remove(id));

        set.dispatch_and_close(&ProcessEvent::interrupted(ProcessId::next(), None));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_channel_listener_forwards() {
        let (tx, rx) = mpsc::channel();
        let listener = ChannelListener(tx);
        let event = ProcessEvent::interrupted(ProcessId::next(), Some(4));
        listener.handle_process_event(&event);
        let received = rx.recv().unwrap();
        assert_eq!(received.kind, ProcessEventKind::Interrupted);
        assert_eq!(received.outcome, None);
    }
}

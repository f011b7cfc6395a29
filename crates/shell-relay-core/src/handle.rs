//! The uniform contract for a running interactive process.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;

use crate::{Backend, TermSize};

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    /// Exit code, if the platform reported one (not killed by a signal).
    pub code: Option<i32>,
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "process exited with code {code}"),
            None => f.write_str("process exited"),
        }
    }
}

/// Something a running process reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A chunk of output, passed through untouched.
    Output(Bytes),
    /// The process is gone. Always the last event.
    Exited(ExitInfo),
}

/// Receives process events. Called from the handle's reader task or thread.
pub type Subscriber = Box<dyn FnMut(ProcessEvent) + Send>;

#[derive(Default)]
struct SlotState {
    subscriber: Option<Subscriber>,
    pending: VecDeque<ProcessEvent>,
    exited: bool,
}

/// Single-subscriber event slot shared between a handle and its readers.
///
/// Events emitted before anyone subscribes are queued and replayed to the
/// first subscriber. Subscribing again replaces the previous subscriber.
/// Nothing is delivered after `Exited`.
///
/// Subscribers run while the slot is locked and must not call back into it.
#[derive(Default)]
pub struct OutputSlot {
    state: Mutex<SlotState>,
}

impl fmt::Debug for OutputSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("OutputSlot")
            .field("subscribed", &state.subscriber.is_some())
            .field("pending", &state.pending.len())
            .field("exited", &state.exited)
            .finish()
    }
}

impl OutputSlot {
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach `subscriber`, flushing anything queued so far.
    pub fn subscribe(&self, mut subscriber: Subscriber) {
        let mut state = self.lock();
        for event in state.pending.drain(..) {
            subscriber(event);
        }
        state.subscriber = Some(subscriber);
    }

    /// Deliver an event to the subscriber, or queue it.
    pub fn emit(&self, event: ProcessEvent) {
        let mut state = self.lock();
        if state.exited {
            return;
        }
        if matches!(event, ProcessEvent::Exited(_)) {
            state.exited = true;
        }
        match state.subscriber.as_mut() {
            Some(subscriber) => subscriber(event),
            None => state.pending.push_back(event),
        }
    }

    /// Shorthand for emitting an output chunk.
    pub fn output(&self, chunk: impl Into<Bytes>) {
        self.emit(ProcessEvent::Output(chunk.into()));
    }

    /// Shorthand for emitting the exit event.
    pub fn exited(&self, code: Option<i32>) {
        self.emit(ProcessEvent::Exited(ExitInfo { code }));
    }

    /// Whether the exit event has been emitted.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.lock().exited
    }
}

/// A running interactive process, independent of the strategy that made it.
///
/// None of these calls block: input is queued, kills are signalled, and the
/// outcome arrives later as a [`ProcessEvent`].
pub trait ProcessHandle: Send + Sync {
    /// Strategy that produced this handle.
    fn backend(&self) -> Backend;

    /// OS process id, when known.
    fn pid(&self) -> Option<u32>;

    /// Replace the event subscriber.
    fn subscribe(&self, subscriber: Subscriber);

    /// Queue bytes for the process's input. A no-op once the process is gone.
    fn write(&self, data: Bytes);

    /// Change terminal dimensions. Ignored by handles without a PTY.
    fn resize(&self, size: TermSize);

    /// Terminate the process. Safe to call any number of times.
    fn kill(&self);

    /// Whether the process is still running.
    fn is_alive(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<ProcessEvent>>>, Subscriber) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Box::new(move |event| sink.lock().unwrap().push(event)))
    }

    #[test]
    fn queued_events_replay_in_order() {
        let slot = OutputSlot::new();
        slot.output(&b"one"[..]);
        slot.output(&b"two"[..]);

        let (seen, subscriber) = recorder();
        slot.subscribe(subscriber);
        slot.output(&b"three"[..]);

        let seen = seen.lock().unwrap();
        let chunks: Vec<_> = seen
            .iter()
            .map(|e| match e {
                ProcessEvent::Output(b) => b.clone(),
                ProcessEvent::Exited(_) => panic!("unexpected exit"),
            })
            .collect();
        assert_eq!(chunks, vec!["one", "two", "three"]);
    }

    #[test]
    fn resubscribe_replaces_previous() {
        let slot = OutputSlot::new();
        let (first, sub1) = recorder();
        let (second, sub2) = recorder();

        slot.subscribe(sub1);
        slot.output(&b"a"[..]);
        slot.subscribe(sub2);
        slot.output(&b"b"[..]);

        assert_eq!(first.lock().unwrap().len(), 1);
        assert_eq!(
            *second.lock().unwrap(),
            vec![ProcessEvent::Output(Bytes::from_static(b"b"))]
        );
    }

    #[test]
    fn exit_is_delivered_once_and_last() {
        let slot = OutputSlot::new();
        let (seen, subscriber) = recorder();
        slot.subscribe(subscriber);

        slot.exited(Some(0));
        slot.exited(Some(1));
        slot.output(&b"late"[..]);

        assert!(slot.has_exited());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ProcessEvent::Exited(ExitInfo { code: Some(0) })]
        );
    }

    #[test]
    fn exit_info_display() {
        assert_eq!(ExitInfo { code: Some(2) }.to_string(), "process exited with code 2");
        assert_eq!(ExitInfo::default().to_string(), "process exited");
    }
}

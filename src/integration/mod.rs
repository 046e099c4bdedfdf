//! Bridge from history change signals to the session recorder.
//!
//! While a compaction is in progress the history re-populates itself with the
//! summary; those content-added signals are swallowed and a single
//! `compressed` event is recorded when the compaction ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::history::{HistoryObserver, HistoryService, Subscription};
use crate::recording::{RecordEvent, RecordingResult, SessionRecordingService, Severity};
use crate::types::Content;

pub struct RecordingIntegration {
    recording: Arc<SessionRecordingService>,
    suppressing: AtomicBool,
    subscription: Mutex<Option<Subscription>>,
}

impl RecordingIntegration {
    pub fn new(recording: Arc<SessionRecordingService>) -> Arc<Self> {
        Arc::new(Self {
            recording,
            suppressing: AtomicBool::new(false),
            subscription: Mutex::new(None),
        })
    }

    pub fn recording(&self) -> &Arc<SessionRecordingService> {
        &self.recording
    }

    /// Start forwarding `history` changes. Replaces any previous subscription.
    pub fn subscribe_to_history(self: &Arc<Self>, history: &HistoryService) {
        let observer: Arc<dyn HistoryObserver> = self.clone();
        let subscription = history.subscribe(&observer);
        *self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(subscription);
    }

    /// Re-subscribe after the host swapped its history instance.
    ///
    /// A compaction bracket cannot span two instances, so suppression is reset.
    pub fn on_history_service_replaced(self: &Arc<Self>, history: &HistoryService) {
        self.unsubscribe();
        self.suppressing.store(false, Ordering::SeqCst);
        self.subscribe_to_history(history);
        tracing::debug!(
            session_id = %self.recording.session_id(),
            "Recording re-subscribed to replaced history"
        );
    }

    pub fn unsubscribe(&self) {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn is_suppressing(&self) -> bool {
        self.suppressing.load(Ordering::SeqCst)
    }

    pub fn record_provider_switch(&self, provider: impl Into<String>, model: impl Into<String>) {
        self.recording
            .enqueue(RecordEvent::provider_switch(provider, model));
    }

    pub fn record_directories_changed(&self, directories: Vec<String>) {
        self.recording
            .enqueue(RecordEvent::directories_changed(directories));
    }

    pub fn record_session_event(&self, severity: Severity, message: impl Into<String>) {
        self.recording
            .enqueue(RecordEvent::session_event(severity, message));
    }

    /// Await at the end of every user-visible turn.
    pub async fn flush_at_turn_boundary(&self) -> RecordingResult<()> {
        self.recording.flush().await
    }
}

impl HistoryObserver for RecordingIntegration {
    fn on_content_added(&self, content: &Content) {
        if self.is_suppressing() {
            tracing::trace!("Suppressing content re-added during compaction");
            return;
        }
        self.recording.enqueue(RecordEvent::content(content.clone()));
    }

    fn on_compaction_started(&self) {
        self.suppressing.store(true, Ordering::SeqCst);
    }

    fn on_compaction_ended(&self, summary: &Content, items_compressed: usize) {
        self.suppressing.store(false, Ordering::SeqCst);
        self.recording
            .enqueue(RecordEvent::compressed(summary.clone(), items_compressed));
    }

    fn on_items_removed(&self, count: usize) {
        self.recording.enqueue(RecordEvent::rewind(count));
    }
}

impl std::fmt::Debug for RecordingIntegration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingIntegration")
            .field("session_id", &self.recording.session_id())
            .field("suppressing", &self.is_suppressing())
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

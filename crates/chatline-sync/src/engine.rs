use crate::config::SyncConfig;
use crate::gate::SelectionGate;
use crate::merger::{DeltaMerger, MergeOutcome};
use crate::notify::NotificationChannel;
use crate::observe::{lock, Observers, Subscription};
use crate::stall::StallMonitor;
use crate::store::{ConversationStore, StoreEvent};
use chatline_core::wire::{decode_binary_frame, decode_frame, FrameError};
use chatline_core::{Conversation, Fragment, Message, Notification, Role};
use std::sync::Mutex;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    MessageIncoming(bool),
    CurrentMessage(String),
}

struct EngineState {
    store: ConversationStore,
    merger: DeltaMerger,
    current_message: String,
    last_good_message: String,
    message_incoming: bool,
}

/// Single owner of the conversation state. Every mutation runs to completion
/// under one lock, so inbound fragments, outbound echoes and gate reads are
/// serialized no matter which task drives them.
///
/// Observer callbacks (engine and store) run inside that critical section and
/// must not call back into the engine; events carry the values they report.
pub struct SyncEngine {
    state: Mutex<EngineState>,
    gate: SelectionGate,
    stall: StallMonitor,
    notifications: NotificationChannel,
    observers: Observers<EngineEvent>,
    max_frame_bytes: usize,
}

impl SyncEngine {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            state: Mutex::new(EngineState {
                store: ConversationStore::new(),
                merger: DeltaMerger::new(),
                current_message: String::new(),
                last_good_message: String::new(),
                message_incoming: false,
            }),
            gate: SelectionGate::new(),
            stall: StallMonitor::new(config.stall_timeout),
            notifications: NotificationChannel::new(),
            observers: Observers::new(),
            max_frame_bytes: config.max_frame_bytes,
        }
    }

    pub fn gate(&self) -> &SelectionGate {
        &self.gate
    }

    pub fn stall(&self) -> &StallMonitor {
        &self.stall
    }

    pub fn notifications(&self) -> &NotificationChannel {
        &self.notifications
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    pub fn subscribe_store<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        lock(&self.state).store.subscribe(callback)
    }

    /// Read access to the store. The closure runs under the engine lock.
    pub fn with_store<R>(&self, read: impl FnOnce(&ConversationStore) -> R) -> R {
        read(&lock(&self.state).store)
    }

    /// Seeds the store from a fetched conversation list.
    pub fn seed(&self, conversations: Vec<Conversation>) {
        lock(&self.state).store.load_conversations(conversations);
    }

    /// Loads a single fetched conversation and makes it current.
    pub fn open_conversation(&self, conversation: Conversation) {
        lock(&self.state).store.upsert_conversation(conversation);
    }

    pub fn set_current_message(&self, text: impl Into<String>) {
        let mut state = lock(&self.state);
        state.current_message = text.into();
        self.notify_current_message(&state);
    }

    pub fn current_message(&self) -> String {
        lock(&self.state).current_message.clone()
    }

    pub fn is_message_incoming(&self) -> bool {
        lock(&self.state).message_incoming
    }

    pub fn pending_fragments(&self) -> usize {
        lock(&self.state).merger.pending()
    }

    /// Bookkeeping for a message handed to the socket: remember the draft for
    /// rollback, clear it, echo non-command messages into the store, and arm
    /// the stall timer.
    pub fn record_outbound(&self, message: Message) {
        let mut state = lock(&self.state);
        self.apply_outbound(&mut state, message);
    }

    /// Runs `transmit` under the engine lock and records the message only when
    /// it reports success. Inbound frames wait on the same lock, so a reply can
    /// never be merged ahead of the echo.
    pub fn transmit_outbound(&self, message: Message, transmit: impl FnOnce() -> bool) -> bool {
        let mut state = lock(&self.state);
        if !transmit() {
            return false;
        }
        self.apply_outbound(&mut state, message);
        true
    }

    /// Ends a turn whose outbound frame never reached the socket: restores the
    /// draft, stops the stall timer and clears the incoming signal. The echo
    /// stays in the store.
    pub fn abandon_turn(&self) {
        let mut state = lock(&self.state);
        self.stall.disarm();
        state.current_message = state.last_good_message.clone();
        self.notify_current_message(&state);
        self.set_incoming(&mut state, false);
    }

    fn apply_outbound(&self, state: &mut EngineState, message: Message) {
        state.last_good_message = std::mem::take(&mut state.current_message);
        self.notify_current_message(state);
        if message.role != Role::Command {
            state.store.apply_message(message);
        }
        self.set_incoming(state, true);
        self.stall.arm();
    }

    pub fn receive_frame(&self, text: &str) {
        self.receive_decoded(decode_frame::<Fragment>(text, self.max_frame_bytes));
    }

    pub fn receive_binary_frame(&self, bytes: &[u8]) {
        self.receive_decoded(decode_binary_frame::<Fragment>(bytes, self.max_frame_bytes));
    }

    fn receive_decoded(&self, decoded: Result<Fragment, FrameError>) {
        match decoded {
            Ok(fragment) => {
                self.handle_fragment(fragment);
            }
            Err(err) => warn!("ws_decode_error: {err}"),
        }
    }

    /// Routes one inbound fragment through the merger and updates the stall
    /// timer, the incoming signal and notifications from the outcome.
    pub fn handle_fragment(&self, fragment: Fragment) -> MergeOutcome {
        let mut state = lock(&self.state);
        let selecting = self.gate.is_selecting();
        let EngineState { store, merger, .. } = &mut *state;
        let outcome = merger.ingest(fragment, selecting, store);
        debug!("fragment_outcome: {outcome:?}");

        match &outcome {
            MergeOutcome::Completed => {
                self.stall.disarm();
                self.set_incoming(&mut state, false);
            }
            MergeOutcome::Failed { text } => {
                self.stall.disarm();
                error!("backend_error: {text}");
                self.notifications.publish(Notification::error(text.clone()));
                state.current_message = state.last_good_message.clone();
                self.notify_current_message(&state);
                self.set_incoming(&mut state, false);
            }
            MergeOutcome::Buffered { .. } | MergeOutcome::Applied { .. } => {
                self.stall.arm();
                self.set_incoming(&mut state, true);
            }
            MergeOutcome::Ignored => self.stall.arm(),
        }
        outcome
    }

    /// Applies anything held back by the selection gate. Arrival of the next
    /// fragment does the same implicitly.
    pub fn flush_pending(&self) -> usize {
        let mut state = lock(&self.state);
        let EngineState { store, merger, .. } = &mut *state;
        merger.flush(store)
    }

    fn notify_current_message(&self, state: &EngineState) {
        let event = EngineEvent::CurrentMessage(state.current_message.clone());
        self.observers.notify(&event);
    }

    fn set_incoming(&self, state: &mut EngineState, incoming: bool) {
        if state.message_incoming == incoming {
            return;
        }
        state.message_incoming = incoming;
        self.observers.notify(&EngineEvent::MessageIncoming(incoming));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatline_core::{ContentBlock, NotificationKind};
    use serde_json::Map;
    use std::sync::Arc;
    use url::Url;

    fn engine() -> SyncEngine {
        let config = SyncConfig::new(Url::parse("ws://127.0.0.1:9/ws").expect("url"));
        SyncEngine::new(&config)
    }

    fn user_message(id: &str, conversation_id: &str, text: &str) -> Message {
        Message {
            id: id.to_string(),
            role: Role::User,
            content: vec![ContentBlock::text(text)],
            status: None,
            conversation_id: conversation_id.to_string(),
            created_at: None,
            meta_data: Map::new(),
        }
    }

    #[tokio::test]
    async fn send_then_stream_then_complete() {
        let engine = engine();
        engine.record_outbound(user_message("m1", "c1", "hi"));
        assert!(engine.is_message_incoming());
        assert!(engine.stall().is_armed());
        assert_eq!(
            engine.with_store(|store| store.conversation("c1").map(|c| c.messages.len())),
            Some(1)
        );

        engine.receive_frame(r#"{"id":"m2","content":[{"type":"text","text":"Hel"}]}"#);
        engine.receive_frame(r#"{"id":"m2","content":[{"type":"text","text":"lo"}]}"#);
        engine.receive_frame(r#"{"status":"complete"}"#);

        engine.with_store(|store| {
            let conversation = store.conversation("c1").expect("conversation");
            assert_eq!(conversation.messages.len(), 2);
            assert_eq!(conversation.messages[1].id, "m2");
            assert_eq!(conversation.messages[1].text(), "Hello");
        });
        assert!(!engine.is_message_incoming());
        assert!(!engine.stall().is_armed());
    }

    #[tokio::test]
    async fn command_messages_are_not_echoed() {
        let engine = engine();
        let mut command = user_message("cmd", "c1", "/regenerate");
        command.role = Role::Command;
        engine.record_outbound(command);
        assert!(engine.with_store(|store| store.conversations().is_empty()));
        assert!(engine.stall().is_armed());
    }

    #[tokio::test]
    async fn error_restores_draft_and_notifies_once() {
        let engine = engine();
        let mut rx = engine.notifications().subscribe();
        engine.set_current_message("explain monads");
        engine.record_outbound(user_message("m1", "c1", "explain monads"));
        assert_eq!(engine.current_message(), "");

        engine.gate().set_selecting(true);
        engine.receive_frame(r#"{"id":"m2","content":[{"type":"text","text":"Mon"}]}"#);
        let outcome = engine.handle_fragment(Fragment {
            role: Some(Role::Error),
            content: vec![ContentBlock::text("quota exceeded")],
            ..Fragment::default()
        });

        assert_eq!(
            outcome,
            MergeOutcome::Failed {
                text: "quota exceeded".to_string()
            }
        );
        assert!(rx.has_changed().expect("channel open"));
        let latest = rx.borrow_and_update().clone();
        assert_eq!(latest.kind, Some(NotificationKind::Error));
        assert_eq!(latest.message, "quota exceeded");
        assert!(!rx.has_changed().expect("channel open"));

        assert_eq!(engine.current_message(), "explain monads");
        assert!(!engine.is_message_incoming());
        assert!(!engine.stall().is_armed());
        assert_eq!(engine.pending_fragments(), 1);
        engine.with_store(|store| {
            let conversation = store.conversation("c1").expect("conversation");
            assert!(conversation
                .messages
                .iter()
                .all(|message| !message.text().contains("quota")));
        });
    }

    #[tokio::test]
    async fn gate_defers_until_next_arrival() {
        let engine = engine();
        engine.record_outbound(user_message("m1", "c1", "hi"));
        engine.receive_frame(r#"{"id":"m2","content":[{"type":"text","text":"A"}]}"#);

        engine.gate().set_selecting(true);
        engine.receive_frame(r#"{"id":"m2","content":[{"type":"text","text":"B"}]}"#);
        engine.receive_frame(r#"{"id":"m2","content":[{"type":"text","text":"C"}]}"#);
        assert_eq!(engine.pending_fragments(), 2);
        assert_eq!(
            engine.with_store(|store| store.message("c1", "m2").map(Message::text)),
            Some("A".to_string())
        );

        engine.gate().set_selecting(false);
        engine.receive_frame(r#"{"id":"m2","content":[{"type":"text","text":"D"}]}"#);
        assert_eq!(engine.pending_fragments(), 0);
        assert_eq!(
            engine.with_store(|store| store.message("c1", "m2").map(Message::text)),
            Some("ABCD".to_string())
        );
    }

    #[tokio::test]
    async fn buffered_delta_stays_with_conversation_it_arrived_in() {
        let engine = engine();
        engine.record_outbound(user_message("u1", "c1", "first"));
        engine.gate().set_selecting(true);
        engine.receive_frame(r#"{"id":"m2","content":[{"type":"text","text":"A"}]}"#);

        engine.record_outbound(user_message("u2", "c2", "second"));
        engine.gate().set_selecting(false);
        engine.receive_frame(r#"{"id":"m3","content":[{"type":"text","text":"B"}]}"#);

        engine.with_store(|store| {
            assert_eq!(store.message("c1", "m2").map(Message::text), Some("A".to_string()));
            assert!(store.message("c2", "m2").is_none());
            assert_eq!(store.message("c2", "m3").map(Message::text), Some("B".to_string()));
        });
    }

    #[tokio::test]
    async fn failed_transmit_leaves_no_trace() {
        let engine = engine();
        engine.set_current_message("draft");
        assert!(!engine.transmit_outbound(user_message("m1", "c1", "draft"), || false));

        assert_eq!(engine.current_message(), "draft");
        assert!(!engine.is_message_incoming());
        assert!(!engine.stall().is_armed());
        assert!(engine.with_store(|store| store.conversations().is_empty()));

        assert!(engine.transmit_outbound(user_message("m1", "c1", "draft"), || true));
        assert_eq!(engine.current_message(), "");
        assert!(engine.is_message_incoming());
    }

    #[tokio::test]
    async fn abandoned_turn_restores_draft_and_ends() {
        let engine = engine();
        engine.set_current_message("draft");
        engine.record_outbound(user_message("m1", "c1", "draft"));

        engine.abandon_turn();
        assert_eq!(engine.current_message(), "draft");
        assert!(!engine.is_message_incoming());
        assert!(!engine.stall().is_armed());
        assert!(engine.with_store(|store| store.message("c1", "m1").is_some()));
    }

    #[tokio::test]
    async fn explicit_flush_drains_after_turn_ended() {
        let engine = engine();
        engine.record_outbound(user_message("m1", "c1", "hi"));
        engine.gate().set_selecting(true);
        engine.receive_frame(r#"{"id":"m2","content":[{"type":"text","text":"tail"}]}"#);
        engine.receive_frame(r#"{"status":"complete"}"#);
        assert!(!engine.is_message_incoming());

        engine.gate().set_selecting(false);
        assert_eq!(engine.flush_pending(), 1);
        assert_eq!(
            engine.with_store(|store| store.message("c1", "m2").map(Message::text)),
            Some("tail".to_string())
        );
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let engine = engine();
        engine.record_outbound(user_message("m1", "c1", "hi"));
        engine.receive_frame("not json");
        engine.receive_binary_frame(&[0xff]);
        assert_eq!(
            engine.with_store(|store| store.conversation("c1").map(|c| c.messages.len())),
            Some(1)
        );
        assert!(engine.notifications().latest().is_empty());
    }

    #[tokio::test]
    async fn engine_events_follow_mutation_order() {
        let engine = engine();
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = events.clone();
        let _subscription = engine.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

        engine.set_current_message("hi");
        engine.record_outbound(user_message("m1", "c1", "hi"));
        engine.receive_frame(r#"{"status":"complete"}"#);

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                EngineEvent::CurrentMessage("hi".to_string()),
                EngineEvent::CurrentMessage(String::new()),
                EngineEvent::MessageIncoming(true),
                EngineEvent::MessageIncoming(false),
            ]
        );
    }
}

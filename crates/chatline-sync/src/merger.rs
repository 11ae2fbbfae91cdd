use crate::store::ConversationStore;
use chatline_core::{Fragment, FragmentKind};
use std::collections::VecDeque;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Held back while the selection gate is closed.
    Buffered { pending: usize },
    /// Buffered fragments plus the new one were applied, in arrival order.
    Applied { count: usize },
    /// Terminal signal for the turn; nothing merged.
    Completed,
    /// Backend-reported failure; nothing merged.
    Failed { text: String },
    /// Nothing could be applied (no resolvable conversation).
    Ignored,
}

/// Applies inbound fragments to the store exactly once each, staging them in a
/// FIFO while the user is selecting rendered text.
#[derive(Debug, Default)]
pub struct DeltaMerger {
    buffer: VecDeque<Fragment>,
}

impl DeltaMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// One synchronous step per inbound fragment: drain the buffer, then apply
    /// the new fragment. Control fragments bypass the buffer and never drain it.
    pub fn ingest(
        &mut self,
        mut fragment: Fragment,
        selecting: bool,
        store: &mut ConversationStore,
    ) -> MergeOutcome {
        if fragment.is_error() {
            return match fragment.classify(None) {
                FragmentKind::Error { text } => MergeOutcome::Failed { text },
                _ => MergeOutcome::Ignored,
            };
        }
        if fragment.is_complete() {
            if !fragment.content.is_empty() {
                debug!(
                    "complete_fragment_content_dropped: blocks={}",
                    fragment.content.len()
                );
            }
            return MergeOutcome::Completed;
        }
        if selecting {
            // Resolve the fallback conversation now; it may change before the drain.
            if fragment.conversation_id.is_none() {
                fragment.conversation_id = store.current_id().map(str::to_string);
            }
            self.buffer.push_back(fragment);
            return MergeOutcome::Buffered {
                pending: self.buffer.len(),
            };
        }

        let mut count = self.flush(store);
        if apply_fragment(fragment, store) {
            count += 1;
        }
        if count == 0 {
            MergeOutcome::Ignored
        } else {
            MergeOutcome::Applied { count }
        }
    }

    /// Applies every buffered fragment in FIFO order; returns how many landed.
    pub fn flush(&mut self, store: &mut ConversationStore) -> usize {
        let mut applied = 0;
        while let Some(buffered) = self.buffer.pop_front() {
            if apply_fragment(buffered, store) {
                applied += 1;
            }
        }
        applied
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn apply_fragment(fragment: Fragment, store: &mut ConversationStore) -> bool {
    match fragment.classify(store.current_id()) {
        FragmentKind::Delta(message) => {
            store.apply_message(message);
            true
        }
        FragmentKind::Orphan { id } => {
            warn!("fragment_orphaned: id={id:?} no conversation in view");
            false
        }
        FragmentKind::Complete | FragmentKind::Error { .. } => false,
    }
}

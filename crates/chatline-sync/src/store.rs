use crate::observe::{Observers, Subscription};
use chatline_core::{Conversation, Message};
use chrono::{DateTime, SecondsFormat, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    ConversationUpserted {
        conversation_id: String,
    },
    ConversationCreated {
        conversation_id: String,
    },
    MessageAppended {
        conversation_id: String,
        message: Message,
    },
    MessageMerged {
        conversation_id: String,
        message: Message,
    },
    CurrentChanged {
        conversation_id: String,
    },
    Listed {
        conversation_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Known id: content merged into the stored message.
    Merged,
    /// New id in a known conversation.
    Appended,
    /// Unknown conversation, created around this message.
    Created,
}

/// Canonical in-memory conversation history. Append/merge only: nothing is
/// ever removed.
#[derive(Default)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
    list: Vec<String>,
    current: Option<String>,
    observers: Observers<StoreEvent>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    /// Replaces the conversation with the same id, or appends it, and makes it
    /// current.
    pub fn upsert_conversation(&mut self, conversation: Conversation) {
        let conversation_id = conversation.id.clone();
        self.replace_or_push(conversation);
        self.observers.notify(&StoreEvent::ConversationUpserted {
            conversation_id: conversation_id.clone(),
        });
        self.set_current(conversation_id);
    }

    /// Seeds the store and the conversation-list view from a fetched list. The
    /// current conversation is left alone.
    pub fn load_conversations(&mut self, conversations: Vec<Conversation>) {
        for conversation in conversations {
            let conversation_id = conversation.id.clone();
            self.replace_or_push(conversation);
            self.observers.notify(&StoreEvent::ConversationUpserted {
                conversation_id: conversation_id.clone(),
            });
            self.ensure_listed(&conversation_id);
        }
    }

    pub fn apply_message(&mut self, message: Message) -> ApplyOutcome {
        self.apply_message_at(message, Utc::now())
    }

    pub fn apply_message_at(&mut self, message: Message, now: DateTime<Utc>) -> ApplyOutcome {
        let stamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        let conversation_id = message.conversation_id.clone();

        let Some(position) = self.position(&conversation_id) else {
            let mut conversation = Conversation::new(conversation_id.clone());
            conversation.created_at = Some(stamp.clone());
            conversation.updated_at = Some(stamp);
            conversation.messages.push(message);
            self.conversations.push(conversation);
            self.observers.notify(&StoreEvent::ConversationCreated {
                conversation_id: conversation_id.clone(),
            });
            self.ensure_listed(&conversation_id);
            self.set_current(conversation_id);
            return ApplyOutcome::Created;
        };

        let conversation = &mut self.conversations[position];
        let (outcome, event) = match conversation
            .messages
            .iter_mut()
            .find(|stored| stored.id == message.id)
        {
            Some(stored) => {
                merge_message(stored, message);
                (
                    ApplyOutcome::Merged,
                    StoreEvent::MessageMerged {
                        conversation_id: conversation_id.clone(),
                        message: stored.clone(),
                    },
                )
            }
            None => {
                let event = StoreEvent::MessageAppended {
                    conversation_id: conversation_id.clone(),
                    message: message.clone(),
                };
                conversation.messages.push(message);
                (ApplyOutcome::Appended, event)
            }
        };
        conversation.updated_at = Some(stamp);

        self.observers.notify(&event);
        self.ensure_listed(&conversation_id);
        self.set_current(conversation_id);
        outcome
    }

    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|conversation| conversation.id == id)
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    /// The conversation-list view, in registration order.
    pub fn conversation_list(&self) -> Vec<&Conversation> {
        self.list
            .iter()
            .filter_map(|id| self.conversation(id))
            .collect()
    }

    pub fn current(&self) -> Option<&Conversation> {
        self.current.as_deref().and_then(|id| self.conversation(id))
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn message(&self, conversation_id: &str, message_id: &str) -> Option<&Message> {
        self.conversation(conversation_id)
            .and_then(|conversation| conversation.message(message_id))
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.conversations
            .iter()
            .position(|conversation| conversation.id == id)
    }

    fn replace_or_push(&mut self, conversation: Conversation) {
        match self.position(&conversation.id) {
            Some(position) => self.conversations[position] = conversation,
            None => self.conversations.push(conversation),
        }
    }

    fn ensure_listed(&mut self, conversation_id: &str) {
        if self.list.iter().any(|id| id == conversation_id) {
            return;
        }
        self.list.push(conversation_id.to_string());
        self.observers.notify(&StoreEvent::Listed {
            conversation_id: conversation_id.to_string(),
        });
    }

    fn set_current(&mut self, conversation_id: String) {
        if self.current.as_deref() == Some(conversation_id.as_str()) {
            return;
        }
        self.current = Some(conversation_id.clone());
        self.observers
            .notify(&StoreEvent::CurrentChanged { conversation_id });
    }
}

/// Position-wise merge: text onto text concatenates, any other shared
/// position takes the incoming block, extra incoming positions are appended.
fn merge_message(stored: &mut Message, incoming: Message) {
    for (position, block) in incoming.content.into_iter().enumerate() {
        match stored.content.get_mut(position) {
            Some(existing) if existing.is_text() && block.is_text() => {
                let addition = block.text.unwrap_or_default();
                existing
                    .text
                    .get_or_insert_with(String::new)
                    .push_str(&addition);
            }
            Some(existing) => *existing = block,
            None => stored.content.push(block),
        }
    }
    if let Some(status) = incoming.status.filter(|status| !status.is_empty()) {
        stored.status = Some(status);
    }
    if stored.created_at.is_none() {
        stored.created_at = incoming.created_at;
    }
    stored.meta_data = incoming.meta_data;
}

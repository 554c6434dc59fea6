//! Conversation state machine.
//!
//! The controller owns the message list and the busy flag. Every backend
//! interaction runs in its own tokio task which reports back through
//! [`ChatUpdate`] messages; the UI loop feeds those into [`ChatController::apply`].
//! Updates carry the id of the conversation and of the reply message they
//! target, so anything left over from a discarded conversation is ignored.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::gateway::{ChatSession, Gateway, GatewayError, SendOptions, Source};
use crate::persona::Persona;

/// Utterance sent on a fresh session to elicit the greeting.
pub const GREETING_PROMPT: &str = "Hello";

pub const CONNECT_ERROR_TEXT: &str =
    "Sorry, I'm having trouble connecting. Please check your API key and try again later.";
pub const REPLY_ERROR_TEXT: &str = "I encountered an error. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    User,
    Bot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub sender: Sender,
    pub text: String,
    /// Web pages a search-grounded reply cited, unique by URI.
    pub sources: Vec<Source>,
}

impl Message {
    fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), sender, text)
    }

    fn with_id(id: Uuid, sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id,
            sender,
            text: text.into(),
            sources: Vec::new(),
        }
    }

    fn add_sources(&mut self, sources: Vec<Source>) {
        for source in sources {
            if !self.sources.iter().any(|s| s.uri == source.uri) {
                self.sources.push(source);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Initializing,
    Idle,
    Streaming,
    Error,
}

/// Which request a stream belongs to. Failures are handled differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    Greeting,
    Reply,
}

pub enum ChatUpdate {
    SessionOpened {
        conversation: u64,
        session: Arc<dyn ChatSession>,
    },
    StreamOpened {
        conversation: u64,
        message: Uuid,
    },
    Fragment {
        conversation: u64,
        message: Uuid,
        text: String,
        sources: Vec<Source>,
    },
    Finished {
        conversation: u64,
        message: Uuid,
    },
    Failed {
        conversation: u64,
        message: Uuid,
        exchange: Exchange,
        error: GatewayError,
    },
}

impl ChatUpdate {
    fn conversation(&self) -> u64 {
        match self {
            ChatUpdate::SessionOpened { conversation, .. }
            | ChatUpdate::StreamOpened { conversation, .. }
            | ChatUpdate::Fragment { conversation, .. }
            | ChatUpdate::Finished { conversation, .. }
            | ChatUpdate::Failed { conversation, .. } => *conversation,
        }
    }
}

/// State of one persona's chat, from selection until reset.
pub struct Conversation {
    id: u64,
    persona: Persona,
    messages: Vec<Message>,
    busy: bool,
    phase: Phase,
    pending: Option<Uuid>,
    session: Option<Arc<dyn ChatSession>>,
    task: Option<JoinHandle<()>>,
}

impl Conversation {
    pub fn persona(&self) -> Persona {
        self.persona
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Id of the bot message still receiving fragments, if any.
    pub fn pending_message(&self) -> Option<Uuid> {
        self.pending
    }

    fn message_mut(&mut self, id: Uuid) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    fn finish(&mut self, phase: Phase) {
        self.busy = false;
        self.pending = None;
        self.phase = phase;
    }

    fn fail(&mut self, message: Uuid, exchange: Exchange, error: &GatewayError) {
        tracing::error!(persona = self.persona.as_str(), ?exchange, %error, "conversation request failed");

        match exchange {
            Exchange::Greeting => {
                self.messages = vec![Message::new(Sender::Bot, CONNECT_ERROR_TEXT)];
            }
            Exchange::Reply => {
                let replacement = Message::new(Sender::Bot, REPLY_ERROR_TEXT);
                match self.messages.iter().position(|m| m.id == message) {
                    Some(idx) => self.messages[idx] = replacement,
                    None => self.messages.push(replacement),
                }
            }
        }
        self.finish(Phase::Error);
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub struct ChatController {
    gateway: Arc<dyn Gateway>,
    updates: mpsc::UnboundedSender<ChatUpdate>,
    conversation: Option<Conversation>,
    next_id: u64,
    web_search: bool,
}

impl ChatController {
    pub fn new(gateway: Arc<dyn Gateway>) -> (Self, mpsc::UnboundedReceiver<ChatUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Self {
            gateway,
            updates: tx,
            conversation: None,
            next_id: 0,
            web_search: false,
        };
        (controller, rx)
    }

    /// Swap the backend. Takes effect from the next `initialize`.
    pub fn set_gateway(&mut self, gateway: Arc<dyn Gateway>) {
        self.gateway = gateway;
    }

    /// Whether replies to submitted messages may be grounded with a web search.
    pub fn web_search(&self) -> bool {
        self.web_search
    }

    /// Applies from the next submitted message. The greeting never searches.
    pub fn set_web_search(&mut self, enabled: bool) {
        self.web_search = enabled;
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    pub fn phase(&self) -> Phase {
        self.conversation
            .as_ref()
            .map(Conversation::phase)
            .unwrap_or(Phase::Uninitialized)
    }

    pub fn is_busy(&self) -> bool {
        self.conversation.as_ref().is_some_and(Conversation::is_busy)
    }

    pub fn messages(&self) -> &[Message] {
        self.conversation
            .as_ref()
            .map(Conversation::messages)
            .unwrap_or(&[])
    }

    /// Start a fresh conversation for `persona`, replacing any current one.
    pub fn initialize(&mut self, persona: Persona) {
        self.reset();

        self.next_id += 1;
        let id = self.next_id;
        let greeting = Uuid::new_v4();

        tracing::info!(persona = persona.as_str(), conversation = id, "initializing conversation");

        let gateway = Arc::clone(&self.gateway);
        let tx = self.updates.clone();
        let instruction = persona.instruction();

        let task = tokio::spawn(async move {
            let session = match gateway.open_session(instruction).await {
                Ok(session) => session,
                Err(error) => {
                    let _ = tx.send(ChatUpdate::Failed {
                        conversation: id,
                        message: greeting,
                        exchange: Exchange::Greeting,
                        error,
                    });
                    return;
                }
            };

            let _ = tx.send(ChatUpdate::SessionOpened {
                conversation: id,
                session: Arc::clone(&session),
            });

            let request = Request {
                conversation: id,
                message: greeting,
                exchange: Exchange::Greeting,
                options: SendOptions::default(),
            };
            stream_reply(session, GREETING_PROMPT.to_string(), request, tx).await;
        });

        self.conversation = Some(Conversation {
            id,
            persona,
            messages: Vec::new(),
            busy: true,
            phase: Phase::Initializing,
            pending: Some(greeting),
            session: None,
            task: Some(task),
        });
    }

    /// Send user text. Returns `false` (and changes nothing) when the text is
    /// blank, a request is already outstanding, or no persona is active.
    pub fn submit_message(&mut self, text: &str) -> bool {
        let Some(conversation) = self.conversation.as_mut() else {
            return false;
        };
        if text.trim().is_empty() || conversation.busy {
            return false;
        }

        conversation.messages.push(Message::new(Sender::User, text));
        let placeholder = Message::new(Sender::Bot, String::new());
        let reply = placeholder.id;
        conversation.messages.push(placeholder);
        conversation.busy = true;
        conversation.pending = Some(reply);
        conversation.phase = Phase::Streaming;

        let id = conversation.id;
        let tx = self.updates.clone();
        let request = Request {
            conversation: id,
            message: reply,
            exchange: Exchange::Reply,
            options: SendOptions {
                web_search: self.web_search,
            },
        };

        let task = match conversation.session.clone() {
            Some(session) => {
                let utterance = text.to_string();
                tokio::spawn(async move {
                    stream_reply(session, utterance, request, tx).await;
                })
            }
            None => tokio::spawn(async move {
                let _ = tx.send(ChatUpdate::Failed {
                    conversation: id,
                    message: reply,
                    exchange: Exchange::Reply,
                    error: GatewayError::SessionOpen("chat session is not initialized".to_string()),
                });
            }),
        };
        conversation.task = Some(task);

        true
    }

    /// Discard the current conversation and its session.
    pub fn reset(&mut self) {
        if let Some(conversation) = self.conversation.take() {
            tracing::info!(conversation = conversation.id, "conversation discarded");
        }
    }

    /// Apply an update from a stream task. Stale updates are dropped.
    pub fn apply(&mut self, update: ChatUpdate) {
        let Some(conversation) = self.conversation.as_mut() else {
            tracing::debug!("dropping update, no active conversation");
            return;
        };
        if update.conversation() != conversation.id {
            tracing::debug!(
                stale = update.conversation(),
                active = conversation.id,
                "dropping update from discarded conversation"
            );
            return;
        }

        match update {
            ChatUpdate::SessionOpened { session, .. } => {
                conversation.session = Some(session);
            }
            ChatUpdate::StreamOpened { message, .. } => {
                if conversation.pending != Some(message) {
                    return;
                }
                if conversation.message_mut(message).is_none() {
                    conversation
                        .messages
                        .push(Message::with_id(message, Sender::Bot, String::new()));
                }
                conversation.phase = Phase::Streaming;
            }
            ChatUpdate::Fragment {
                message,
                text,
                sources,
                ..
            } => {
                if conversation.pending != Some(message) {
                    return;
                }
                if let Some(target) = conversation.message_mut(message) {
                    target.text.push_str(&text);
                    target.add_sources(sources);
                }
            }
            ChatUpdate::Finished { message, .. } => {
                if conversation.pending == Some(message) {
                    conversation.finish(Phase::Idle);
                }
            }
            ChatUpdate::Failed {
                message,
                exchange,
                error,
                ..
            } => {
                if conversation.pending == Some(message) {
                    conversation.fail(message, exchange, &error);
                }
            }
        }
    }
}

/// Where a stream's updates go and how the request is made.
#[derive(Clone, Copy)]
struct Request {
    conversation: u64,
    message: Uuid,
    exchange: Exchange,
    options: SendOptions,
}

async fn stream_reply(
    session: Arc<dyn ChatSession>,
    utterance: String,
    request: Request,
    tx: mpsc::UnboundedSender<ChatUpdate>,
) {
    let Request {
        conversation,
        message,
        exchange,
        options,
    } = request;
    let failed = |error: GatewayError| ChatUpdate::Failed {
        conversation,
        message,
        exchange,
        error,
    };

    let mut fragments = match session.send_streaming(&utterance, options).await {
        Ok(stream) => stream,
        Err(error) => {
            let _ = tx.send(failed(error));
            return;
        }
    };

    let _ = tx.send(ChatUpdate::StreamOpened { conversation, message });

    while let Some(item) = fragments.next().await {
        match item {
            Ok(fragment) => {
                let update = ChatUpdate::Fragment {
                    conversation,
                    message,
                    text: fragment.text,
                    sources: fragment.sources,
                };
                if tx.send(update).is_err() {
                    return;
                }
            }
            Err(error) => {
                let _ = tx.send(failed(error));
                return;
            }
        }
    }

    let _ = tx.send(ChatUpdate::Finished { conversation, message });
}

//! Backend seam for the conversation.
//!
//! The conversation state machine only ever talks to these two traits, so the
//! Gemini client and the scripted test gateway are interchangeable.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("no API key configured for the assistant backend")]
    CredentialMissing,

    /// The backend could not be reached or rejected the request.
    #[error("could not open a session: {0}")]
    SessionOpen(String),

    #[error("reply stream failed: {0}")]
    Stream(String),
}

/// Web page the backend grounded a reply on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub uri: String,
    pub title: String,
}

/// One streamed piece of a reply: a text delta plus any sources that arrived with it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
    pub sources: Vec<Source>,
}

impl From<&str> for Fragment {
    fn from(text: &str) -> Self {
        Self {
            text: text.to_string(),
            sources: Vec::new(),
        }
    }
}

/// Per-request switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Let the model ground its answer with a web search.
    pub web_search: bool,
}

/// Finite, non-restartable sequence of reply fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<Fragment, GatewayError>> + Send>>;

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Open a dialogue bound to a fixed system instruction.
    async fn open_session(&self, instruction: &str) -> Result<Arc<dyn ChatSession>, GatewayError>;
}

#[async_trait]
pub trait ChatSession: Send + Sync {
    async fn send_streaming(
        &self,
        utterance: &str,
        options: SendOptions,
    ) -> Result<FragmentStream, GatewayError>;
}

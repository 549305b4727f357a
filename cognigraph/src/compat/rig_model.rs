//! [`ModelClient`] backed by a Rig agent
//!
//! System messages become the completion preamble (appended to the agent's
//! own), the last message is the prompt and everything before it is history.
//! Backend errors are reported as [`CollaboratorError::Unavailable`], so the
//! scheduler retries them.
//!
//! ```rust,ignore
//! use rig::client::{CompletionClient, Nothing};
//! use rig::providers::ollama;
//!
//! let client = ollama::Client::builder().api_key(Nothing).base_url(host).build()?;
//! let model = RigModelClient::with_name(client.agent("qwen3:8b").build(), "ollama/qwen3:8b");
//! let builtins = Builtins::new(context, Arc::new(model), capabilities);
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use rig::agent::Agent;
use rig::completion::{Completion, CompletionModel, GetTokenUsage, Message as RigMessage};
use rig::message::AssistantContent;
use rig::streaming::StreamedAssistantContent;

use crate::collaborators::{Message, ModelChunk, ModelClient, ModelOptions, ModelReply, ModelStream, Role, TokenUsage};
use crate::error::CollaboratorError;

pub struct RigModelClient<M>
where
    M: CompletionModel + Send + Sync,
{
    agent: Arc<Agent<M>>,
    name: String,
}

impl<M> RigModelClient<M>
where
    M: CompletionModel + Send + Sync,
{
    pub fn new(agent: Agent<M>) -> Self {
        Self::with_name(agent, "rig")
    }

    /// Name shown in logs, e.g. `ollama/qwen3:8b`
    pub fn with_name(agent: Agent<M>, name: impl Into<String>) -> Self {
        Self {
            agent: Arc::new(agent),
            name: name.into(),
        }
    }

    pub fn agent(&self) -> &Agent<M> {
        &self.agent
    }
}

fn backend_error(err: impl std::fmt::Display) -> CollaboratorError {
    CollaboratorError::unavailable("model", format!("rig agent error: {}", err))
}

fn usage_from_rig(usage: &rig::completion::Usage) -> TokenUsage {
    TokenUsage::new(usage.input_tokens, usage.output_tokens)
}

struct Conversation {
    prompt: RigMessage,
    history: Vec<RigMessage>,
    preamble: Option<String>,
}

fn split_conversation(messages: &[Message]) -> Result<Conversation, CollaboratorError> {
    let mut system = Vec::new();
    let mut turns = Vec::new();
    for message in messages {
        match message.role {
            Role::System if !message.content.trim().is_empty() => system.push(message.content.clone()),
            Role::System => {}
            Role::User => turns.push(RigMessage::user(message.content.clone())),
            Role::Assistant => turns.push(RigMessage::assistant(message.content.clone())),
        }
    }

    let prompt = turns
        .pop()
        .ok_or_else(|| CollaboratorError::failed("model", "transcript has no user or assistant turn"))?;
    Ok(Conversation {
        prompt,
        history: turns,
        preamble: (!system.is_empty()).then(|| system.join("\n\n")),
    })
}

impl<M> RigModelClient<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    async fn request(
        &self,
        role: &str,
        messages: &[Message],
        options: &ModelOptions,
    ) -> Result<rig::completion::CompletionRequestBuilder<M>, CollaboratorError> {
        let conversation = split_conversation(messages)?;
        debug!(client = %self.name, role, turns = conversation.history.len() + 1, "Model request");

        let mut builder = self
            .agent
            .completion(conversation.prompt, conversation.history)
            .await
            .map_err(backend_error)?;

        if let Some(extra) = conversation.preamble {
            let preamble = match self.agent.preamble.as_deref() {
                Some(own) => format!("{}\n\n{}", own, extra),
                None => extra,
            };
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = options.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }
        Ok(builder)
    }
}

#[async_trait]
impl<M> ModelClient for RigModelClient<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    async fn call_model(
        &self,
        role: &str,
        messages: &[Message],
        options: &ModelOptions,
    ) -> Result<ModelReply, CollaboratorError> {
        let response = self
            .request(role, messages, options)
            .await?
            .send()
            .await
            .map_err(backend_error)?;

        let content = response
            .choice
            .iter()
            .filter_map(|item| match item {
                AssistantContent::Text(text) => Some(text.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(ModelReply {
            content,
            usage: usage_from_rig(&response.usage),
        })
    }

    async fn stream_model(
        &self,
        role: &str,
        messages: &[Message],
        options: &ModelOptions,
    ) -> Result<ModelStream, CollaboratorError> {
        let stream = self
            .request(role, messages, options)
            .await?
            .stream()
            .await
            .map_err(backend_error)?;

        let mapped = stream.filter_map(|item| async move {
            match item {
                Ok(StreamedAssistantContent::Text(text)) => Some(Ok(ModelChunk {
                    content: text.text,
                    usage: None,
                })),
                Ok(StreamedAssistantContent::Final(response)) => Some(Ok(ModelChunk {
                    content: String::new(),
                    usage: response.token_usage().map(|usage| usage_from_rig(&usage)),
                })),
                Ok(_) => None,
                Err(err) => Some(Err(backend_error(err))),
            }
        });
        Ok(Box::pin(mapped))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<M> std::fmt::Debug for RigModelClient<M>
where
    M: CompletionModel + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RigModelClient").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig::message::UserContent;

    fn text(message: &RigMessage) -> Option<String> {
        match message {
            RigMessage::User { content } => content.iter().find_map(|item| match item {
                UserContent::Text(text) => Some(text.text.clone()),
                _ => None,
            }),
            RigMessage::Assistant { content, .. } => content.iter().find_map(|item| match item {
                AssistantContent::Text(text) => Some(text.text.clone()),
                _ => None,
            }),
        }
    }

    #[test]
    fn test_split_conversation() {
        let messages = vec![
            Message::system("persona"),
            Message::user("hello"),
            Message::assistant("hi"),
            Message::system("memories"),
            Message::user("next"),
        ];
        let conversation = split_conversation(&messages).unwrap();

        assert_eq!(conversation.preamble.as_deref(), Some("persona\n\nmemories"));
        assert_eq!(conversation.history.len(), 2);
        assert_eq!(text(&conversation.history[1]).as_deref(), Some("hi"));
        assert_eq!(text(&conversation.prompt).as_deref(), Some("next"));
    }

    #[test]
    fn test_system_only_transcript_is_rejected() {
        let err = split_conversation(&[Message::system("only rules")]).err().unwrap();
        assert!(!err.is_transient());
    }
}

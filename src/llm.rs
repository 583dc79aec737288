use crate::config::OpenAiConfig;
use crate::context::ContextMessage;
use anyhow::{Context, Result, bail};
use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPrompt {
    pub system: String,
    pub user: String,
}

/// Anything that turns a prompt into reply text.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, prompt: &ReplyPrompt) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratedReply {
    Model(String),
    Fallback(String),
}

impl GeneratedReply {
    pub fn text(&self) -> &str {
        match self {
            Self::Model(text) | Self::Fallback(text) => text,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

pub fn build_reply_prompt(
    system_prompt: &str,
    contact: &str,
    history: &[ContextMessage],
    incoming: &str,
) -> ReplyPrompt {
    let history: String = history
        .iter()
        .map(|message| format!("{}\n", message.as_history_line()))
        .collect();

    let user = format!(
        "You are an AI assistant responding to WhatsApp messages on behalf of your user.\n\
         \n\
         Conversation history with {contact}:\n\
         {history}\n\
         New message from {contact}: {incoming}\n\
         \n\
         Please respond naturally and helpfully. Keep responses concise and conversational, suitable for WhatsApp.\n\
         If the message requires urgent attention or is very important, suggest they call or mention you'll get back to them soon.\n\
         Don't mention that you're an AI unless directly asked."
    );

    ReplyPrompt {
        system: system_prompt.to_owned(),
        user,
    }
}

/// Asks the model for a reply; any failure or empty answer yields `fallback`.
pub async fn generate_reply<M>(model: &M, prompt: &ReplyPrompt, fallback: &str) -> GeneratedReply
where
    M: CompletionModel + ?Sized,
{
    match model.complete(prompt).await {
        Ok(text) if !text.trim().is_empty() => GeneratedReply::Model(text.trim().to_owned()),
        Ok(_) => {
            warn!("completion returned empty text; using fallback reply");
            GeneratedReply::Fallback(fallback.to_owned())
        }
        Err(err) => {
            warn!(error = %err, "completion request failed; using fallback reply");
            GeneratedReply::Fallback(fallback.to_owned())
        }
    }
}

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(config: &OpenAiConfig) -> Result<Self> {
        let api_key = config.api_key.trim();
        if api_key.is_empty() {
            bail!("openai api key must not be empty");
        }

        let mut openai_config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(api_base) = config.api_base.as_deref() {
            openai_config = openai_config.with_api_base(api_base.trim().trim_end_matches('/'));
        }

        debug!(
            model = %config.model,
            timeout_seconds = config.timeout_seconds,
            "built openai client"
        );

        Ok(Self {
            client: Client::with_config(openai_config),
            model: config.model.trim().to_owned(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout: Duration::from_secs(config.timeout_seconds),
        })
    }
}

#[async_trait]
impl CompletionModel for OpenAiClient {
    async fn complete(&self, prompt: &ReplyPrompt) -> Result<String> {
        let system = ChatCompletionRequestSystemMessageArgs::default()
            .content(prompt.system.as_str())
            .build()
            .context("failed to build system message")?;
        let user = ChatCompletionRequestUserMessageArgs::default()
            .content(prompt.user.as_str())
            .build()
            .context("failed to build user message")?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(self.model.as_str())
            .messages(vec![system.into(), user.into()])
            .max_completion_tokens(self.max_tokens)
            .temperature(self.temperature)
            .build()
            .context("failed to build chat completion request")?;

        debug!(model = %self.model, "sending completion request to openai");

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .with_context(|| {
                format!(
                    "openai request timed out after {} seconds",
                    self.timeout.as_secs()
                )
            })?
            .context("openai chat completion request failed")?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .context("openai response missing assistant message")?;

        Ok(content.trim().to_owned())
    }
}

use crate::config::{HotConfig, ReplyConfig};
use crate::context::ConversationContexts;
use crate::dedupe::{DedupeCache, ProcessedMessageId};
use crate::llm::{CompletionModel, GeneratedReply, build_reply_prompt, generate_reply};
use crate::policy::ContactPolicy;
use crate::surface::{ChatSurface, ScrapedMessage};
use anyhow::anyhow;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const MAX_REPLY_CHARS: usize = 4096;
const LOG_PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    CycleStarted {
        unread_chats: usize,
    },
    ChatSkipped {
        reason: String,
    },
    MessageReceived {
        contact: String,
        text: String,
    },
    PolicyDenied {
        contact: String,
    },
    ReplySent {
        contact: String,
        text: String,
        fallback: bool,
    },
    ReplyNotSent {
        contact: String,
        outcome: SendOutcome,
    },
}

#[derive(Default, Clone)]
pub struct ReplyHooks {
    on_event: Option<Arc<dyn Fn(ReplyEvent) + Send + Sync>>,
}

impl ReplyHooks {
    pub fn with_event_handler<F>(handler: F) -> Self
    where
        F: Fn(ReplyEvent) + Send + Sync + 'static,
    {
        Self {
            on_event: Some(Arc::new(handler)),
        }
    }

    fn emit(&self, event: ReplyEvent) {
        if let Some(handler) = self.on_event.as_ref() {
            handler(event);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReplyRuntimeOptions {
    /// Generate replies but never type them into the web client.
    pub dry_run: bool,
    /// Reply text used instead of calling the model.
    pub reply_override: Option<String>,
}

/// Result of opening one unread chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatScan {
    Messages { contact: String, texts: Vec<String> },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    DryRun,
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub unread_chats: usize,
    pub chats_skipped: usize,
    pub new_messages: usize,
    pub denied_by_policy: usize,
    pub replies_sent: usize,
    pub fallback_replies: usize,
    pub send_failures: usize,
}

#[derive(Debug, Error)]
pub enum CycleError {
    /// Worth retrying after a backoff.
    #[error("poll cycle failed: {0:#}")]
    Transient(anyhow::Error),
    /// The browser is gone; the session cannot continue.
    #[error("browser session lost: {0:#}")]
    SessionLost(anyhow::Error),
}

/// State owned by one reply session: contexts, processed ids and policy.
pub struct ReplySession {
    contexts: ConversationContexts,
    processed: DedupeCache,
    policy: ContactPolicy,
    settings: ReplyConfig,
    system_prompt: String,
    options: ReplyRuntimeOptions,
    hooks: ReplyHooks,
}

impl ReplySession {
    pub fn new(hot_config: &HotConfig, options: ReplyRuntimeOptions, hooks: ReplyHooks) -> Self {
        let reply = &hot_config.reply;
        Self {
            contexts: ConversationContexts::new(),
            processed: DedupeCache::new(reply.dedupe_per_contact, reply.dedupe_contacts),
            policy: ContactPolicy::from_config(&hot_config.policy),
            settings: reply.clone(),
            system_prompt: hot_config.openai.system_prompt.clone(),
            options: normalize_options(options),
            hooks,
        }
    }

    pub fn apply_hot_config(&mut self, hot_config: &HotConfig) {
        let reply = &hot_config.reply;
        self.processed.set_limits(reply.dedupe_per_contact, reply.dedupe_contacts);
        self.policy = ContactPolicy::from_config(&hot_config.policy);
        self.settings = reply.clone();
        self.system_prompt = hot_config.openai.system_prompt.clone();
    }

    pub fn policy_mut(&mut self) -> &mut ContactPolicy {
        &mut self.policy
    }

    pub fn contexts(&self) -> &ConversationContexts {
        &self.contexts
    }

    /// Opens every unread chat once, answering new inbound messages in the
    /// chat they arrived in.
    pub async fn run_cycle<S, M>(
        &mut self,
        surface: &S,
        model: &M,
    ) -> Result<CycleReport, CycleError>
    where
        S: ChatSurface,
        M: CompletionModel + ?Sized,
    {
        ensure_connected(surface)?;

        let chats = surface
            .unread_chats()
            .await
            .map_err(CycleError::Transient)?;
        let mut report = CycleReport {
            unread_chats: chats.len(),
            ..CycleReport::default()
        };
        if !chats.is_empty() {
            debug!(unread_chats = chats.len(), "found unread chats");
        }
        self.hooks.emit(ReplyEvent::CycleStarted {
            unread_chats: chats.len(),
        });

        for chat in &chats {
            match self.scan_chat(surface, chat).await {
                ChatScan::Skipped { reason } => {
                    ensure_connected(surface)?;
                    report.chats_skipped += 1;
                    self.hooks.emit(ReplyEvent::ChatSkipped { reason });
                }
                ChatScan::Messages { contact, texts } => {
                    for text in texts {
                        report.new_messages += 1;
                        self.respond(surface, model, &contact, &text, &mut report)
                            .await;
                    }
                }
            }
        }

        Ok(report)
    }

    async fn scan_chat<S: ChatSurface>(&mut self, surface: &S, chat: &S::Chat) -> ChatScan {
        let contact = match surface.open_chat(chat).await {
            Ok(contact) => contact,
            Err(err) => {
                error!(error = %err, "failed to open chat");
                return ChatScan::Skipped {
                    reason: format!("{err:#}"),
                };
            }
        };

        let scraped = match surface.recent_messages(self.settings.scan_messages).await {
            Ok(scraped) => scraped,
            Err(err) => {
                error!(contact = %contact, error = %err, "failed to read chat messages");
                return ChatScan::Skipped {
                    reason: format!("{err:#}"),
                };
            }
        };

        let texts = self.take_new_inbound(&contact, scraped);
        ChatScan::Messages { contact, texts }
    }

    /// Marks inbound texts processed as they are seen, whatever the policy
    /// later decides.
    fn take_new_inbound(&mut self, contact: &str, scraped: Vec<ScrapedMessage>) -> Vec<String> {
        scraped
            .into_iter()
            .filter(|message| !message.outgoing)
            .filter_map(|message| {
                let text = message.text.trim();
                if text.is_empty() {
                    return None;
                }
                let id = ProcessedMessageId::derive(contact, text);
                if self.processed.insert(contact, id) {
                    Some(text.to_owned())
                } else {
                    None
                }
            })
            .collect()
    }

    async fn respond<S, M>(
        &mut self,
        surface: &S,
        model: &M,
        contact: &str,
        text: &str,
        report: &mut CycleReport,
    ) where
        S: ChatSurface,
        M: CompletionModel + ?Sized,
    {
        info!(contact, text = %preview(text), "new message");
        self.hooks.emit(ReplyEvent::MessageReceived {
            contact: contact.to_owned(),
            text: text.to_owned(),
        });

        if !self.policy.permits(contact) {
            info!(contact, "skipping reply; contact is blacklisted or not whitelisted");
            report.denied_by_policy += 1;
            self.hooks.emit(ReplyEvent::PolicyDenied {
                contact: contact.to_owned(),
            });
            return;
        }

        let reply = match self.options.reply_override.as_deref() {
            Some(override_text) => {
                debug!(contact, "using fixed reply override");
                GeneratedReply::Model(override_text.to_owned())
            }
            None => {
                let history = self
                    .contexts
                    .recent(contact, self.settings.context_messages);
                let prompt = build_reply_prompt(&self.system_prompt, contact, &history, text);
                generate_reply(model, &prompt, &self.settings.fallback_reply).await
            }
        };

        let reply_text = truncate_chars(reply.text(), MAX_REPLY_CHARS);
        if reply.is_fallback() {
            report.fallback_replies += 1;
        } else {
            self.contexts.record_exchange(contact, text, reply_text);
        }

        tokio::time::sleep(Duration::from_secs(self.settings.response_delay_seconds)).await;

        match self.send(surface, reply_text).await {
            SendOutcome::Sent => {
                info!(contact, reply = %preview(reply_text), "sent reply");
                report.replies_sent += 1;
                self.hooks.emit(ReplyEvent::ReplySent {
                    contact: contact.to_owned(),
                    text: reply_text.to_owned(),
                    fallback: reply.is_fallback(),
                });
            }
            outcome => {
                if matches!(outcome, SendOutcome::Failed(_)) {
                    report.send_failures += 1;
                }
                self.hooks.emit(ReplyEvent::ReplyNotSent {
                    contact: contact.to_owned(),
                    outcome,
                });
            }
        }
    }

    async fn send<S: ChatSurface>(&self, surface: &S, text: &str) -> SendOutcome {
        if self.options.dry_run {
            info!(reply = %preview(text), "dry run; reply not sent");
            return SendOutcome::DryRun;
        }
        match surface.send_message(text).await {
            Ok(()) => SendOutcome::Sent,
            Err(err) => {
                warn!(error = %err, "failed to send reply");
                SendOutcome::Failed(format!("{err:#}"))
            }
        }
    }
}

fn ensure_connected<S: ChatSurface>(surface: &S) -> Result<(), CycleError> {
    if surface.is_connected() {
        Ok(())
    } else {
        Err(CycleError::SessionLost(anyhow!(
            "browser connection closed"
        )))
    }
}

fn normalize_options(options: ReplyRuntimeOptions) -> ReplyRuntimeOptions {
    ReplyRuntimeOptions {
        reply_override: normalize_reply_override(options.reply_override),
        ..options
    }
}

pub fn normalize_reply_override(reply_override: Option<String>) -> Option<String> {
    reply_override
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn truncate_chars(input: &str, max_chars: usize) -> &str {
    match input.char_indices().nth(max_chars) {
        Some((byte_offset, _)) => &input[..byte_offset],
        None => input,
    }
}

fn preview(text: &str) -> String {
    let truncated = truncate_chars(text, LOG_PREVIEW_CHARS);
    if truncated.len() < text.len() {
        format!("{truncated}...")
    } else {
        truncated.to_owned()
    }
}

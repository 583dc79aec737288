use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wa_llm_autoreply::app::run_reply_mode_with_shutdown_and_hooks;
use wa_llm_autoreply::config::{
    ConfigMode, HotConfig, OpenAiConfig, PolicyConfig, ReplyConfig, load_config_for_mode,
};
use wa_llm_autoreply::context::MAX_CONTEXT_MESSAGES;
use wa_llm_autoreply::llm::{CompletionModel, ReplyPrompt};
use wa_llm_autoreply::session::{
    CycleError, ReplyEvent, ReplyHooks, ReplyRuntimeOptions, ReplySession, SendOutcome,
};
use wa_llm_autoreply::surface::{ChatSurface, ScrapedMessage};

const FALLBACK: &str = "Thanks for your message! I'll get back to you soon.";

struct FakeChat {
    contact: String,
    messages: Vec<ScrapedMessage>,
    unread: bool,
    fail_open: bool,
}

/// In-memory web client: opening a chat clears its unread flag, sending
/// appends an outgoing message to the open chat.
#[derive(Default)]
struct FakeSurface {
    chats: Mutex<Vec<FakeChat>>,
    current: Mutex<Option<usize>>,
    sent: Mutex<Vec<(String, String)>>,
    fail_send: AtomicBool,
    disconnected: AtomicBool,
}

impl FakeSurface {
    fn receive(&self, contact: &str, text: &str) {
        let mut chats = self.chats.lock().unwrap();
        let idx = match chats.iter().position(|chat| chat.contact == contact) {
            Some(idx) => idx,
            None => {
                chats.push(FakeChat {
                    contact: contact.to_owned(),
                    messages: Vec::new(),
                    unread: false,
                    fail_open: false,
                });
                chats.len() - 1
            }
        };
        chats[idx].messages.push(ScrapedMessage::inbound(text));
        chats[idx].unread = true;
    }

    fn break_chat(&self, contact: &str) {
        let mut chats = self.chats.lock().unwrap();
        if let Some(chat) = chats.iter_mut().find(|chat| chat.contact == contact) {
            chat.fail_open = true;
        }
    }

    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatSurface for FakeSurface {
    type Chat = usize;

    async fn unread_chats(&self) -> Result<Vec<usize>> {
        let chats = self.chats.lock().unwrap();
        Ok(chats
            .iter()
            .enumerate()
            .filter(|(_, chat)| chat.unread)
            .map(|(idx, _)| idx)
            .collect())
    }

    async fn open_chat(&self, chat: &usize) -> Result<String> {
        let mut chats = self.chats.lock().unwrap();
        let entry = chats.get_mut(*chat).context("no such chat")?;
        if entry.fail_open {
            bail!("element is stale");
        }
        entry.unread = false;
        *self.current.lock().unwrap() = Some(*chat);
        Ok(entry.contact.clone())
    }

    async fn recent_messages(&self, limit: usize) -> Result<Vec<ScrapedMessage>> {
        let current = (*self.current.lock().unwrap()).context("no chat open")?;
        let chats = self.chats.lock().unwrap();
        let messages = &chats[current].messages;
        let start = messages.len().saturating_sub(limit);
        Ok(messages[start..].to_vec())
    }

    async fn send_message(&self, text: &str) -> Result<()> {
        if self.fail_send.load(Ordering::SeqCst) {
            bail!("compose box not found");
        }
        let current = (*self.current.lock().unwrap()).context("no chat open")?;
        let mut chats = self.chats.lock().unwrap();
        chats[current].messages.push(ScrapedMessage::outgoing(text));
        self.sent
            .lock()
            .unwrap()
            .push((chats[current].contact.clone(), text.to_owned()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }
}

/// Echoes the incoming line back, answers with a fixed text, or fails every
/// call.
struct ScriptedModel {
    fail: bool,
    fixed: Option<String>,
    prompts: Mutex<Vec<ReplyPrompt>>,
}

impl ScriptedModel {
    fn echo() -> Self {
        Self {
            fail: false,
            fixed: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::echo()
        }
    }

    fn fixed(reply: impl Into<String>) -> Self {
        Self {
            fixed: Some(reply.into()),
            ..Self::echo()
        }
    }

    fn prompts(&self) -> Vec<ReplyPrompt> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionModel for ScriptedModel {
    async fn complete(&self, prompt: &ReplyPrompt) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.clone());
        if self.fail {
            bail!("429 Too Many Requests");
        }
        if let Some(reply) = self.fixed.as_ref() {
            return Ok(reply.clone());
        }
        let incoming = prompt
            .user
            .lines()
            .find_map(|line| line.split_once(": ").filter(|(head, _)| head.starts_with("New message from")))
            .map(|(_, text)| text.to_owned())
            .unwrap_or_default();
        Ok(format!("re: {incoming}"))
    }
}

fn hot_config(policy: PolicyConfig) -> HotConfig {
    hot_config_with_reply(
        policy,
        ReplyConfig {
            response_delay_seconds: 0,
            ..ReplyConfig::default()
        },
    )
}

fn hot_config_with_reply(policy: PolicyConfig, reply: ReplyConfig) -> HotConfig {
    HotConfig {
        openai: OpenAiConfig {
            api_key: "sk-test".to_owned(),
            api_base: None,
            model: "gpt-3.5-turbo".to_owned(),
            max_tokens: 150,
            temperature: 0.7,
            timeout_seconds: 5,
            system_prompt: "You are a helpful AI assistant responding to WhatsApp messages."
                .to_owned(),
        },
        reply,
        policy,
    }
}

fn session_with(
    policy: PolicyConfig,
    options: ReplyRuntimeOptions,
) -> (ReplySession, Arc<Mutex<Vec<ReplyEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let hooks = ReplyHooks::with_event_handler(move |event| {
        sink.lock().unwrap().push(event);
    });
    (
        ReplySession::new(&hot_config(policy), options, hooks),
        events,
    )
}

fn session() -> (ReplySession, Arc<Mutex<Vec<ReplyEvent>>>) {
    session_with(PolicyConfig::default(), ReplyRuntimeOptions::default())
}

fn names(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_owned()).collect()
}

#[tokio::test]
async fn replies_land_in_the_chat_they_answer() -> Result<()> {
    let surface = FakeSurface::default();
    let model = ScriptedModel::echo();
    let (mut session, _) = session();

    surface.receive("Alice", "hi there");
    surface.receive("Bob", "are you free?");

    let report = session.run_cycle(&surface, &model).await?;

    assert_eq!(report.unread_chats, 2);
    assert_eq!(report.new_messages, 2);
    assert_eq!(report.replies_sent, 2);
    assert_eq!(
        surface.sent(),
        vec![
            ("Alice".to_owned(), "re: hi there".to_owned()),
            ("Bob".to_owned(), "re: are you free?".to_owned()),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn whitelist_blocks_everyone_else_and_denied_messages_stay_processed() -> Result<()> {
    let surface = FakeSurface::default();
    let model = ScriptedModel::echo();
    let (mut session, events) = session_with(
        PolicyConfig {
            blacklist: Vec::new(),
            whitelist: names(&["Alice"]),
        },
        ReplyRuntimeOptions::default(),
    );

    surface.receive("Bob", "hello?");
    let report = session.run_cycle(&surface, &model).await?;
    assert_eq!(report.denied_by_policy, 1);
    assert!(surface.sent().is_empty());
    assert!(model.prompts().is_empty());
    assert!(events.lock().unwrap().contains(&ReplyEvent::PolicyDenied {
        contact: "Bob".to_owned()
    }));

    session.policy_mut().add_to_whitelist("Bob");
    surface.receive("Bob", "anyone?");
    let report = session.run_cycle(&surface, &model).await?;
    assert_eq!(report.new_messages, 1, "the first message must not be reprocessed");
    assert_eq!(surface.sent(), vec![("Bob".to_owned(), "re: anyone?".to_owned())]);
    Ok(())
}

#[tokio::test]
async fn blacklist_wins() -> Result<()> {
    let surface = FakeSurface::default();
    let model = ScriptedModel::echo();
    let (mut session, _) = session_with(
        PolicyConfig {
            blacklist: names(&["Bob"]),
            whitelist: Vec::new(),
        },
        ReplyRuntimeOptions::default(),
    );

    surface.receive("Bob", "spam");
    surface.receive("Alice", "hey");
    session.run_cycle(&surface, &model).await?;

    assert_eq!(surface.sent(), vec![("Alice".to_owned(), "re: hey".to_owned())]);
    Ok(())
}

#[tokio::test]
async fn visible_messages_are_answered_once() -> Result<()> {
    let surface = FakeSurface::default();
    let model = ScriptedModel::echo();
    let (mut session, _) = session();

    surface.receive("Alice", "first");
    session.run_cycle(&surface, &model).await?;
    surface.receive("Alice", "second");
    let report = session.run_cycle(&surface, &model).await?;

    assert_eq!(report.new_messages, 1);
    assert_eq!(
        surface.sent(),
        vec![
            ("Alice".to_owned(), "re: first".to_owned()),
            ("Alice".to_owned(), "re: second".to_owned()),
        ]
    );

    let idle = session.run_cycle(&surface, &model).await?;
    assert_eq!(idle.unread_chats, 0);
    assert_eq!(idle.new_messages, 0);
    Ok(())
}

#[tokio::test]
async fn outgoing_and_blank_messages_are_ignored() -> Result<()> {
    let surface = FakeSurface::default();
    let model = ScriptedModel::echo();
    let (mut session, _) = session();

    surface.receive("Alice", "   ");
    {
        let mut chats = surface.chats.lock().unwrap();
        chats[0].messages.push(ScrapedMessage::outgoing("my own words"));
    }

    let report = session.run_cycle(&surface, &model).await?;
    assert_eq!(report.unread_chats, 1);
    assert_eq!(report.new_messages, 0);
    assert!(surface.sent().is_empty());
    Ok(())
}

#[tokio::test]
async fn prompt_carries_recent_history() -> Result<()> {
    let surface = FakeSurface::default();
    let model = ScriptedModel::echo();
    let (mut session, _) = session();

    surface.receive("Alice", "my name is Alice");
    session.run_cycle(&surface, &model).await?;
    surface.receive("Alice", "what is my name?");
    session.run_cycle(&surface, &model).await?;

    let prompts = model.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(
        prompts[0]
            .system
            .contains("helpful AI assistant responding to WhatsApp messages")
    );
    assert!(prompts[1].user.contains("Alice: my name is Alice"));
    assert!(prompts[1].user.contains("AI Assistant: re: my name is Alice"));
    assert!(prompts[1].user.contains("New message from Alice: what is my name?"));
    assert_eq!(session.contexts().message_count("Alice"), 4);
    Ok(())
}

#[tokio::test]
async fn context_never_exceeds_cap() -> Result<()> {
    let surface = FakeSurface::default();
    let model = ScriptedModel::echo();
    let (mut session, _) = session();

    for idx in 0..8 {
        surface.receive("Alice", &format!("message {idx}"));
        session.run_cycle(&surface, &model).await?;
        assert!(session.contexts().message_count("Alice") <= MAX_CONTEXT_MESSAGES);
    }

    let last_prompt = model.prompts().pop().context("model should have been called")?;
    assert!(!last_prompt.user.contains("Alice: message 4\n"));
    assert!(last_prompt.user.contains("AI Assistant: re: message 6"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn old_visible_messages_stay_answered_after_a_long_silence() -> Result<()> {
    let surface = FakeSurface::default();
    let model = ScriptedModel::echo();
    let (mut session, _) = session();

    surface.receive("Alice", "hi");
    session.run_cycle(&surface, &model).await?;

    tokio::time::advance(Duration::from_secs(3 * 24 * 60 * 60)).await;
    surface.receive("Alice", "second");
    session.run_cycle(&surface, &model).await?;

    assert_eq!(
        surface.sent(),
        vec![
            ("Alice".to_owned(), "re: hi".to_owned()),
            ("Alice".to_owned(), "re: second".to_owned()),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn tight_dedupe_memory_still_covers_the_scan_window() -> Result<()> {
    let surface = FakeSurface::default();
    let model = ScriptedModel::echo();
    let mut session = ReplySession::new(
        &hot_config_with_reply(
            PolicyConfig::default(),
            ReplyConfig {
                response_delay_seconds: 0,
                scan_messages: 3,
                dedupe_per_contact: 3,
                ..ReplyConfig::default()
            },
        ),
        ReplyRuntimeOptions::default(),
        ReplyHooks::default(),
    );

    for idx in 0..12 {
        surface.receive("Alice", &format!("note {idx}"));
        session.run_cycle(&surface, &model).await?;
    }

    let sent = surface.sent();
    assert_eq!(sent.len(), 12);
    for (idx, (_, text)) in sent.iter().enumerate() {
        assert_eq!(text, &format!("re: note {idx}"));
    }
    Ok(())
}

#[tokio::test]
async fn context_keeps_the_reply_as_sent() -> Result<()> {
    let surface = FakeSurface::default();
    let model = ScriptedModel::fixed("x".repeat(5000));
    let (mut session, _) = session();

    surface.receive("Alice", "write me an essay");
    session.run_cycle(&surface, &model).await?;

    let sent = surface.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1.chars().count(), 4096);
    let recorded = session.contexts().recent("Alice", 1);
    assert_eq!(recorded[0].text, sent[0].1);
    Ok(())
}

#[tokio::test]
async fn failing_model_sends_fallback_without_recording_context() -> Result<()> {
    let surface = FakeSurface::default();
    let model = ScriptedModel::failing();
    let (mut session, events) = session();

    surface.receive("Alice", "hi");
    let report = session.run_cycle(&surface, &model).await?;

    assert_eq!(report.fallback_replies, 1);
    assert_eq!(surface.sent(), vec![("Alice".to_owned(), FALLBACK.to_owned())]);
    assert_eq!(session.contexts().message_count("Alice"), 0);
    assert!(events.lock().unwrap().contains(&ReplyEvent::ReplySent {
        contact: "Alice".to_owned(),
        text: FALLBACK.to_owned(),
        fallback: true,
    }));
    Ok(())
}

#[tokio::test]
async fn send_failure_is_reported_and_loop_continues() -> Result<()> {
    let surface = FakeSurface::default();
    let model = ScriptedModel::echo();
    let (mut session, events) = session();
    surface.fail_send.store(true, Ordering::SeqCst);

    surface.receive("Alice", "hi");
    let report = session.run_cycle(&surface, &model).await?;

    assert_eq!(report.send_failures, 1);
    assert_eq!(report.replies_sent, 0);
    let failed = events.lock().unwrap().iter().any(|event| {
        matches!(
            event,
            ReplyEvent::ReplyNotSent {
                outcome: SendOutcome::Failed(_),
                ..
            }
        )
    });
    assert!(failed);

    surface.fail_send.store(false, Ordering::SeqCst);
    surface.receive("Alice", "still there?");
    let report = session.run_cycle(&surface, &model).await?;
    assert_eq!(report.replies_sent, 1);
    Ok(())
}

#[tokio::test]
async fn broken_chat_is_skipped_while_others_are_answered() -> Result<()> {
    let surface = FakeSurface::default();
    let model = ScriptedModel::echo();
    let (mut session, events) = session();

    surface.receive("Alice", "hi");
    surface.receive("Bob", "yo");
    surface.break_chat("Alice");

    let report = session.run_cycle(&surface, &model).await?;

    assert_eq!(report.chats_skipped, 1);
    assert_eq!(surface.sent(), vec![("Bob".to_owned(), "re: yo".to_owned())]);
    assert!(
        events
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, ReplyEvent::ChatSkipped { .. }))
    );
    Ok(())
}

#[tokio::test]
async fn lost_browser_aborts_the_cycle() {
    let surface = FakeSurface::default();
    let model = ScriptedModel::echo();
    let (mut session, _) = session();
    surface.disconnected.store(true, Ordering::SeqCst);

    let result = session.run_cycle(&surface, &model).await;
    assert!(matches!(result, Err(CycleError::SessionLost(_))));
}

#[tokio::test]
async fn dry_run_generates_but_never_sends() -> Result<()> {
    let surface = FakeSurface::default();
    let model = ScriptedModel::echo();
    let (mut session, events) = session_with(
        PolicyConfig::default(),
        ReplyRuntimeOptions {
            dry_run: true,
            reply_override: None,
        },
    );

    surface.receive("Alice", "hi");
    session.run_cycle(&surface, &model).await?;

    assert!(surface.sent().is_empty());
    assert_eq!(model.prompts().len(), 1);
    assert!(events.lock().unwrap().contains(&ReplyEvent::ReplyNotSent {
        contact: "Alice".to_owned(),
        outcome: SendOutcome::DryRun,
    }));
    Ok(())
}

#[tokio::test]
async fn reply_override_bypasses_the_model() -> Result<()> {
    let surface = FakeSurface::default();
    let model = ScriptedModel::failing();
    let (mut session, _) = session_with(
        PolicyConfig::default(),
        ReplyRuntimeOptions {
            dry_run: false,
            reply_override: Some(" [auto] ".to_owned()),
        },
    );

    surface.receive("Alice", "hi");
    session.run_cycle(&surface, &model).await?;

    assert!(model.prompts().is_empty());
    assert_eq!(surface.sent(), vec![("Alice".to_owned(), "[auto]".to_owned())]);
    Ok(())
}

#[tokio::test]
async fn reloaded_policy_applies_to_next_cycle() -> Result<()> {
    let surface = FakeSurface::default();
    let model = ScriptedModel::echo();
    let (mut session, _) = session();

    session.apply_hot_config(&hot_config(PolicyConfig {
        blacklist: names(&["Alice"]),
        whitelist: Vec::new(),
    }));
    surface.receive("Alice", "hi");
    let report = session.run_cycle(&surface, &model).await?;

    assert_eq!(report.denied_by_policy, 1);
    assert!(surface.sent().is_empty());
    Ok(())
}

#[tokio::test]
#[ignore = "requires Chrome, a logged-in WhatsApp Web profile and config.toml"]
async fn live_session_starts_and_shuts_down_cleanly() -> Result<()> {
    let config_path = std::path::PathBuf::from("config.toml");
    let config = load_config_for_mode(&config_path, ConfigMode::Reply)
        .with_context(|| format!("failed to load config at {}", config_path.display()))?;

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let hooks = ReplyHooks::with_event_handler(move |event| {
        sink.lock().unwrap().push(event);
    });

    run_reply_mode_with_shutdown_and_hooks(
        &config,
        &config_path,
        tokio::time::sleep(Duration::from_secs(30)),
        hooks,
        ReplyRuntimeOptions {
            dry_run: true,
            reply_override: None,
        },
    )
    .await?;

    let cycles = events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| matches!(event, ReplyEvent::CycleStarted { .. }))
        .count();
    eprintln!("[it] completed {cycles} poll cycles");
    assert!(cycles > 0, "expected at least one poll cycle");
    Ok(())
}

use crate::config::{Config, HotConfig, OpenAiConfig, extract_hot_config, load_hot_config};
use crate::llm::{CompletionModel, OpenAiClient};
use crate::session::{CycleError, ReplyHooks, ReplyRuntimeOptions, ReplySession};
use crate::surface::ChatSurface;
use crate::whatsapp::WebClient;
use anyhow::{Context, Result};
use notify::{
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::ModifyKind,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};
use tracing_log::LogTracer;
use tracing_subscriber::EnvFilter;

const FIXED_REPLY_ENV: &str = "WA_AUTOREPLY_FIXED_REPLY";
const RELOAD_SETTLE: Duration = Duration::from_millis(250);

impl ReplyRuntimeOptions {
    pub fn from_env(dry_run: bool) -> Self {
        Self {
            dry_run,
            reply_override: std::env::var(FIXED_REPLY_ENV).ok(),
        }
    }
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();

pub fn init_tracing() {
    TRACING_INIT.get_or_init(|| {
        let _ = LogTracer::init();
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .try_init();
    });
}

pub async fn run_reply_mode(
    config: &Config,
    config_path: &Path,
    runtime_options: ReplyRuntimeOptions,
) -> Result<()> {
    run_reply_mode_with_shutdown_and_hooks(
        config,
        config_path,
        async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for Ctrl+C");
            }
        },
        ReplyHooks::default(),
        runtime_options,
    )
    .await
}

pub async fn run_reply_mode_with_shutdown_and_hooks<S>(
    config: &Config,
    config_path: &Path,
    shutdown_signal: S,
    hooks: ReplyHooks,
    runtime_options: ReplyRuntimeOptions,
) -> Result<()>
where
    S: Future<Output = ()>,
{
    let active =
        ActiveReplyState::from_hot_config(extract_hot_config(config)?, &OpenAiClient::new)?;
    let mut client = WebClient::launch(&config.browser, config.selectors.clone()).await?;

    let result: Result<()> = async {
        client
            .wait_until_logged_in(Duration::from_secs(config.browser.login_timeout_seconds))
            .await
            .context("failed to log into the web client")?;

        let (hot_tx, hot_rx) = watch::channel(active.hot_config.clone());
        let _watcher = spawn_config_watcher(config_path, hot_tx)?;
        let mut session = ReplySession::new(&active.hot_config, runtime_options, hooks);

        info!(
            config_path = %config_path.display(),
            model = %active.hot_config.openai.model,
            "auto-reply session started"
        );

        tokio::select! {
            () = shutdown_signal => {
                info!("shutdown signal received");
                Ok(())
            }
            result = poll_loop(&client, &mut session, active, hot_rx, OpenAiClient::new) => result,
        }
    }
    .await;

    if let Err(err) = client.shutdown().await {
        warn!(error = %err, "failed to shut down browser cleanly");
    }
    info!("browser session closed");
    result
}

pub async fn run_list_chats_mode(config: &Config, query: Option<&str>) -> Result<()> {
    let mut client = WebClient::launch(&config.browser, config.selectors.clone()).await?;

    let result: Result<()> = async {
        client
            .wait_until_logged_in(Duration::from_secs(config.browser.login_timeout_seconds))
            .await
            .context("failed to log into the web client")?;
        let chats = client.list_chats(query).await?;
        for chat in &chats {
            println!("{}", chat.name);
        }
        info!(chat_count = chats.len(), "listed chats");
        Ok(())
    }
    .await;

    if let Err(err) = client.shutdown().await {
        warn!(error = %err, "failed to shut down browser cleanly");
    }
    result
}

/// Polls until the browser goes away. Loop-level failures back off and retry.
///
/// `build_model` turns each reloaded `[openai]` section into a client; a
/// reload it rejects leaves the previous config active.
async fn poll_loop<S, M, B>(
    surface: &S,
    session: &mut ReplySession,
    mut active: ActiveReplyState<M>,
    mut hot_rx: watch::Receiver<HotConfig>,
    build_model: B,
) -> Result<()>
where
    S: ChatSurface,
    M: CompletionModel,
    B: Fn(&OpenAiConfig) -> Result<M>,
{
    info!("starting message processing loop");

    loop {
        if hot_rx.has_changed().unwrap_or(false) {
            let new_hot = hot_rx.borrow_and_update().clone();
            match ActiveReplyState::from_hot_config(new_hot, &build_model) {
                Ok(new_active) => {
                    session.apply_hot_config(&new_active.hot_config);
                    info!(
                        model = %new_active.hot_config.openai.model,
                        enabled = new_active.hot_config.reply.enabled,
                        blacklist = ?new_active.hot_config.policy.blacklist,
                        whitelist = ?new_active.hot_config.policy.whitelist,
                        "config reloaded"
                    );
                    active = new_active;
                }
                Err(err) => {
                    warn!(error = %err, "ignoring config reload; keeping previous active config");
                }
            }
        }

        let reply = &active.hot_config.reply;
        let poll_interval = Duration::from_secs(reply.poll_interval_seconds);
        if !reply.enabled {
            debug!("auto-reply disabled; idling");
            tokio::time::sleep(poll_interval).await;
            continue;
        }

        let delay = match session.run_cycle(surface, &active.llm).await {
            Ok(report) => {
                if report.new_messages > 0 || report.chats_skipped > 0 {
                    info!(
                        unread_chats = report.unread_chats,
                        chats_skipped = report.chats_skipped,
                        new_messages = report.new_messages,
                        denied_by_policy = report.denied_by_policy,
                        replies_sent = report.replies_sent,
                        fallback_replies = report.fallback_replies,
                        send_failures = report.send_failures,
                        "poll cycle finished"
                    );
                }
                poll_interval
            }
            Err(CycleError::SessionLost(err)) => {
                error!(error = %err, "browser session lost; stopping");
                return Err(err.context("browser session lost"));
            }
            Err(err) => {
                error!(error = %err, "error in message processing loop");
                Duration::from_secs(reply.error_backoff_seconds)
            }
        };

        tokio::time::sleep(delay).await;
    }
}

struct ActiveReplyState<M> {
    hot_config: HotConfig,
    llm: M,
}

impl<M> ActiveReplyState<M> {
    fn from_hot_config<B>(hot_config: HotConfig, build_model: &B) -> Result<Self>
    where
        B: Fn(&OpenAiConfig) -> Result<M>,
    {
        let llm = build_model(&hot_config.openai)?;
        Ok(Self { hot_config, llm })
    }
}

/// Writes, creations and renames landing on the config file. Removal alone
/// never reloads; atomic saves finish with a create or rename.
fn is_config_change(event: &Event, config_path: &Path) -> bool {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Name(_) | ModifyKind::Any)
    );
    relevant
        && event.paths.iter().any(|path| {
            path == config_path
                || path
                    .canonicalize()
                    .is_ok_and(|canonical| canonical == config_path)
        })
}

fn changed_sections(current: &HotConfig, next: &HotConfig) -> Vec<&'static str> {
    let mut sections = Vec::new();
    if current.openai != next.openai {
        sections.push("openai");
    }
    if current.reply != next.reply {
        sections.push("reply");
    }
    if current.policy != next.policy {
        sections.push("policy");
    }
    sections
}

/// Watches the config file's directory and publishes every valid hot config
/// that differs from the current one. Bursts of events collapse into one
/// reload after `RELOAD_SETTLE`. The reload task ends once the poll loop drops
/// its receiver.
fn spawn_config_watcher(
    config_path: &Path,
    hot_tx: watch::Sender<HotConfig>,
) -> Result<RecommendedWatcher> {
    let config_path: PathBuf = config_path.canonicalize().with_context(|| {
        format!(
            "failed to canonicalize config path: {}",
            config_path.display()
        )
    })?;
    let parent = config_path
        .parent()
        .context("config path has no parent directory")?
        .to_owned();

    let pending = Arc::new(Notify::new());
    let watcher_pending = Arc::clone(&pending);
    let watched_path = config_path.clone();
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        match res {
            Ok(event) if is_config_change(&event, &watched_path) => watcher_pending.notify_one(),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "filesystem watcher error"),
        }
    })
    .context("failed to create filesystem watcher")?;

    watcher
        .watch(&parent, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch directory: {}", parent.display()))?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = hot_tx.closed() => break,
                () = pending.notified() => {}
            }
            tokio::time::sleep(RELOAD_SETTLE).await;

            let next = match load_hot_config(&config_path) {
                Ok(next) => next,
                Err(err) => {
                    warn!(error = %err, "config reload failed; keeping previous config");
                    continue;
                }
            };
            hot_tx.send_if_modified(|current| {
                let sections = changed_sections(current, &next);
                if sections.is_empty() {
                    debug!("config file touched without hot changes");
                    return false;
                }
                info!(sections = ?sections, "config file changed");
                *current = next;
                true
            });
        }
        debug!("config watcher stopped");
    });

    Ok(watcher)
}

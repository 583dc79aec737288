use anyhow::{Context, Result, bail};
use reqwest::Url;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::context::MAX_CONTEXT_MESSAGES;

const DEFAULT_WEB_CLIENT_URL: &str = "https://web.whatsapp.com";
const DEFAULT_USER_DATA_DIR: &str = "./whatsapp_session";
const DEFAULT_WINDOW_WIDTH: u32 = 1920;
const DEFAULT_WINDOW_HEIGHT: u32 = 1080;
const DEFAULT_LOGIN_TIMEOUT_SECONDS: u64 = 60;

const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_OPENAI_MAX_TOKENS: u32 = 150;
const DEFAULT_OPENAI_TEMPERATURE: f32 = 0.7;
const DEFAULT_OPENAI_TIMEOUT_SECONDS: u64 = 20;
const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant responding to WhatsApp messages.";

const DEFAULT_RESPONSE_DELAY_SECONDS: u64 = 2;
const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 5;
const DEFAULT_ERROR_BACKOFF_SECONDS: u64 = 10;
const DEFAULT_CONTEXT_MESSAGES: usize = 5;
const DEFAULT_SCAN_MESSAGES: usize = 5;
const DEFAULT_FALLBACK_REPLY: &str = "Thanks for your message! I'll get back to you soon.";
const DEFAULT_DEDUPE_PER_CONTACT: usize = 50;
const DEFAULT_DEDUPE_CONTACTS: usize = 1_000;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub selectors: SelectorConfig,
    pub openai: Option<OpenAiConfig>,
    #[serde(default)]
    pub reply: ReplyConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub url: String,
    pub headless: bool,
    pub user_data_dir: PathBuf,
    pub chrome_executable: Option<PathBuf>,
    pub window_width: u32,
    pub window_height: u32,
    pub login_timeout_seconds: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WEB_CLIENT_URL.to_owned(),
            headless: false,
            user_data_dir: PathBuf::from(DEFAULT_USER_DATA_DIR),
            chrome_executable: None,
            window_width: DEFAULT_WINDOW_WIDTH,
            window_height: DEFAULT_WINDOW_HEIGHT,
            login_timeout_seconds: DEFAULT_LOGIN_TIMEOUT_SECONDS,
        }
    }
}

/// CSS selectors for the web client markup. The defaults match current
/// WhatsApp Web and need updating whenever its markup changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub chat_list: String,
    pub chat_row: String,
    pub chat_title: String,
    pub unread_chat: String,
    pub conversation_header: String,
    pub message_container: String,
    pub outgoing_marker: String,
    pub message_text: String,
    pub compose_box: String,
    pub send_button: String,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            chat_list: r#"[data-testid="chat-list"]"#.to_owned(),
            chat_row: r#"[data-testid="chat-list"] [role="listitem"]"#.to_owned(),
            chat_title: "span[title]".to_owned(),
            unread_chat:
                r#"[data-testid="chat-list"] [role="listitem"]:has([data-testid="icon-unread"])"#
                    .to_owned(),
            conversation_header: r#"[data-testid="conversation-header"] ._ao3e"#.to_owned(),
            message_container: r#"[data-testid="msg-container"]"#.to_owned(),
            outgoing_marker: r#"[data-testid="msg-meta"] [data-testid="msg-check"]"#.to_owned(),
            message_text: "span.selectable-text".to_owned(),
            compose_box: r#"[data-testid="conversation-compose-box-input"]"#.to_owned(),
            send_button: r#"[data-testid="send"]"#.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub api_base: Option<String>,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default = "default_openai_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_openai_temperature")]
    pub temperature: f32,
    #[serde(default = "default_openai_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReplyConfig {
    pub enabled: bool,
    pub response_delay_seconds: u64,
    pub poll_interval_seconds: u64,
    pub error_backoff_seconds: u64,
    pub context_messages: usize,
    pub scan_messages: usize,
    pub fallback_reply: String,
    /// Processed ids remembered per contact; at least `scan_messages`.
    pub dedupe_per_contact: usize,
    pub dedupe_contacts: usize,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            response_delay_seconds: DEFAULT_RESPONSE_DELAY_SECONDS,
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECONDS,
            error_backoff_seconds: DEFAULT_ERROR_BACKOFF_SECONDS,
            context_messages: DEFAULT_CONTEXT_MESSAGES,
            scan_messages: DEFAULT_SCAN_MESSAGES,
            fallback_reply: DEFAULT_FALLBACK_REPLY.to_owned(),
            dedupe_per_contact: DEFAULT_DEDUPE_PER_CONTACT,
            dedupe_contacts: DEFAULT_DEDUPE_CONTACTS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub blacklist: Vec<String>,
    pub whitelist: Vec<String>,
}

/// The part of the config that can change while the browser session stays up.
#[derive(Debug, Clone, PartialEq)]
pub struct HotConfig {
    pub openai: OpenAiConfig,
    pub reply: ReplyConfig,
    pub policy: PolicyConfig,
}

fn default_openai_model() -> String {
    DEFAULT_OPENAI_MODEL.to_owned()
}

fn default_openai_max_tokens() -> u32 {
    DEFAULT_OPENAI_MAX_TOKENS
}

fn default_openai_temperature() -> f32 {
    DEFAULT_OPENAI_TEMPERATURE
}

fn default_openai_timeout_seconds() -> u64 {
    DEFAULT_OPENAI_TIMEOUT_SECONDS
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigMode {
    Reply,
    ListChats,
}

pub fn load_config_for_mode(path: &Path, mode: ConfigMode) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_and_validate_config(&raw, mode)
}

fn parse_and_validate_config(raw: &str, mode: ConfigMode) -> Result<Config> {
    let config: Config = toml::from_str(raw).context("failed to parse config.toml as TOML")?;
    validate_config_for_mode(&config, mode)?;
    Ok(config)
}

fn validate_browser_config(config: &BrowserConfig) -> Result<()> {
    Url::parse(config.url.trim()).context("browser.url must be a valid URL string")?;
    if config.user_data_dir.as_os_str().is_empty() {
        bail!("browser.user_data_dir must not be empty");
    }
    if config.window_width == 0 || config.window_height == 0 {
        bail!("browser window size must be positive");
    }
    if config.login_timeout_seconds == 0 {
        bail!("browser.login_timeout_seconds must be positive");
    }
    Ok(())
}

fn validate_selector_config(config: &SelectorConfig) -> Result<()> {
    let selectors = [
        ("chat_list", &config.chat_list),
        ("chat_row", &config.chat_row),
        ("chat_title", &config.chat_title),
        ("unread_chat", &config.unread_chat),
        ("conversation_header", &config.conversation_header),
        ("message_container", &config.message_container),
        ("outgoing_marker", &config.outgoing_marker),
        ("message_text", &config.message_text),
        ("compose_box", &config.compose_box),
        ("send_button", &config.send_button),
    ];
    for (name, selector) in selectors {
        if selector.trim().is_empty() {
            bail!("selectors.{name} must not be empty");
        }
    }
    Ok(())
}

fn validate_openai_config(config: &OpenAiConfig) -> Result<()> {
    if config.api_key.trim().is_empty() {
        bail!("openai.api_key must not be empty");
    }
    if let Some(api_base) = config.api_base.as_deref() {
        Url::parse(api_base.trim()).context("openai.api_base must be a valid URL string")?;
    }
    if config.model.trim().is_empty() {
        bail!("openai.model must not be empty");
    }
    if config.max_tokens == 0 {
        bail!("openai.max_tokens must be positive");
    }
    if !(0.0..=2.0).contains(&config.temperature) {
        bail!("openai.temperature must be between 0 and 2");
    }
    if config.system_prompt.trim().is_empty() {
        bail!("openai.system_prompt must not be empty");
    }
    Ok(())
}

fn validate_reply_config(config: &ReplyConfig) -> Result<()> {
    if config.poll_interval_seconds == 0 {
        bail!("reply.poll_interval_seconds must be positive");
    }
    if config.context_messages > MAX_CONTEXT_MESSAGES {
        bail!("reply.context_messages must be at most {MAX_CONTEXT_MESSAGES}");
    }
    if config.scan_messages == 0 {
        bail!("reply.scan_messages must be positive");
    }
    if config.fallback_reply.trim().is_empty() {
        bail!("reply.fallback_reply must not be empty");
    }
    if config.dedupe_per_contact < config.scan_messages {
        bail!(
            "reply.dedupe_per_contact must be at least reply.scan_messages ({})",
            config.scan_messages
        );
    }
    if config.dedupe_contacts == 0 {
        bail!("reply.dedupe_contacts must be positive");
    }
    Ok(())
}

fn validate_policy_config(config: &PolicyConfig) -> Result<()> {
    let blank = config
        .blacklist
        .iter()
        .chain(config.whitelist.iter())
        .any(|name| name.trim().is_empty());
    if blank {
        bail!("policy lists must not contain empty contact names");
    }
    Ok(())
}

fn validate_config_for_mode(config: &Config, mode: ConfigMode) -> Result<()> {
    validate_browser_config(&config.browser)?;
    validate_selector_config(&config.selectors)?;

    if mode == ConfigMode::Reply {
        let openai = config
            .openai
            .as_ref()
            .context("missing required [openai] section for reply mode")?;
        validate_openai_config(openai)?;
        validate_reply_config(&config.reply)?;
        validate_policy_config(&config.policy)?;
    }

    Ok(())
}

impl Config {
    pub fn openai_required(&self) -> Result<&OpenAiConfig> {
        self.openai
            .as_ref()
            .context("missing required [openai] section")
    }
}

pub fn extract_hot_config(config: &Config) -> Result<HotConfig> {
    let openai = config.openai_required()?;
    Ok(HotConfig {
        openai: openai.clone(),
        reply: config.reply.clone(),
        policy: config.policy.clone(),
    })
}

pub fn load_hot_config(path: &Path) -> Result<HotConfig> {
    let config = load_config_for_mode(path, ConfigMode::Reply)?;
    extract_hot_config(&config)
}

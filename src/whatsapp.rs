use crate::config::{BrowserConfig, SelectorConfig};
use crate::surface::{ChatSurface, ScrapedMessage};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chromiumoxide::{Browser, BrowserConfig as LaunchConfig, Element, Page};
use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const CHAT_OPEN_SETTLE: Duration = Duration::from_secs(1);
const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(500);
const COMPOSE_BOX_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("chat list did not appear within {} seconds; was the QR code scanned?", .0.as_secs())]
    Timeout(Duration),
    #[error("browser connection closed while waiting for login")]
    BrowserClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatListItem {
    pub name: String,
}

/// A WhatsApp Web tab driven over the DevTools protocol.
///
/// The browser process is closed by [`WebClient::shutdown`]; if that never
/// runs, dropping the client kills the process and stops the handler task.
pub struct WebClient {
    browser: Option<Browser>,
    page: Page,
    selectors: SelectorConfig,
    handler_task: Option<JoinHandle<()>>,
}

impl WebClient {
    pub async fn launch(config: &BrowserConfig, selectors: SelectorConfig) -> Result<Self> {
        let launch_config = build_launch_config(config)?;
        let (browser, mut handler) = Browser::launch(launch_config)
            .await
            .context("failed to launch browser")?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "browser protocol handler error");
                }
            }
            info!("browser protocol handler ended");
        });

        let page = match browser.new_page(config.url.trim()).await {
            Ok(page) => page,
            Err(err) => {
                handler_task.abort();
                return Err(err)
                    .with_context(|| format!("failed to open web client at {}", config.url));
            }
        };

        info!(
            url = %config.url,
            headless = config.headless,
            user_data_dir = %config.user_data_dir.display(),
            "opened web client"
        );

        Ok(Self {
            browser: Some(browser),
            page,
            selectors,
            handler_task: Some(handler_task),
        })
    }

    pub async fn wait_until_logged_in(&self, timeout: Duration) -> Result<(), LoginError> {
        info!(
            timeout_seconds = timeout.as_secs(),
            "waiting for login; scan the QR code in the browser window if prompted"
        );
        match self.wait_for_selector(&self.selectors.chat_list, timeout).await {
            Ok(_) => {
                info!("logged into web client");
                Ok(())
            }
            Err(err) => {
                debug!(error = %err, "chat list never appeared");
                if self.is_connected() {
                    Err(LoginError::Timeout(timeout))
                } else {
                    Err(LoginError::BrowserClosed)
                }
            }
        }
    }

    pub async fn list_chats(&self, query: Option<&str>) -> Result<Vec<ChatListItem>> {
        let rows = self
            .page
            .find_elements(self.selectors.chat_row.as_str())
            .await
            .context("failed to query chat list rows")?;

        let mut names = Vec::with_capacity(rows.len());
        for row in &rows {
            match chat_row_name(row, &self.selectors.chat_title).await {
                Ok(Some(name)) => names.push(name),
                Ok(None) => {}
                Err(err) => debug!(error = %err, "skipping unreadable chat row"),
            }
        }

        Ok(filter_and_sort_chat_names(names, query)
            .into_iter()
            .map(|name| ChatListItem { name })
            .collect())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        let closed = match self.browser.take() {
            Some(mut browser) => close_browser(&mut browser).await,
            None => Ok(()),
        };
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
        closed
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<Element> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.page.find_element(selector).await {
                Ok(element) => return Ok(element),
                Err(err) => {
                    if Instant::now() >= deadline || !self.is_connected() {
                        return Err(err)
                            .with_context(|| format!("timed out waiting for selector {selector}"));
                    }
                }
            }
            tokio::time::sleep(SELECTOR_POLL_INTERVAL).await;
        }
    }

    async fn read_message(&self, container: &Element) -> Result<ScrapedMessage> {
        let outgoing = !container
            .find_elements(self.selectors.outgoing_marker.as_str())
            .await
            .context("failed to check outgoing marker")?
            .is_empty();
        let text = container
            .find_element(self.selectors.message_text.as_str())
            .await
            .context("message has no text element")?
            .inner_text()
            .await
            .context("failed to read message text")?
            .unwrap_or_default();
        Ok(ScrapedMessage { outgoing, text })
    }
}

impl Drop for WebClient {
    fn drop(&mut self) {
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl ChatSurface for WebClient {
    type Chat = Element;

    async fn unread_chats(&self) -> Result<Vec<Element>> {
        self.page
            .find_elements(self.selectors.unread_chat.as_str())
            .await
            .context("failed to query unread chats")
    }

    async fn open_chat(&self, chat: &Element) -> Result<String> {
        chat.click().await.context("failed to click chat")?;
        tokio::time::sleep(CHAT_OPEN_SETTLE).await;

        let header = self
            .page
            .find_element(self.selectors.conversation_header.as_str())
            .await
            .context("conversation header not found")?;
        let name = header
            .inner_text()
            .await
            .context("failed to read conversation header")?
            .unwrap_or_default();
        let name = name.trim();
        if name.is_empty() {
            bail!("conversation header has no contact name");
        }
        Ok(name.to_owned())
    }

    async fn recent_messages(&self, limit: usize) -> Result<Vec<ScrapedMessage>> {
        let containers = self
            .page
            .find_elements(self.selectors.message_container.as_str())
            .await
            .context("failed to query message containers")?;
        let start = containers.len().saturating_sub(limit);

        let mut messages = Vec::with_capacity(containers.len() - start);
        for container in &containers[start..] {
            match self.read_message(container).await {
                Ok(message) => messages.push(message),
                Err(err) => debug!(error = %err, "skipping unreadable message element"),
            }
        }
        Ok(messages)
    }

    async fn send_message(&self, text: &str) -> Result<()> {
        let compose = self
            .wait_for_selector(&self.selectors.compose_box, COMPOSE_BOX_TIMEOUT)
            .await
            .context("compose box not found")?;
        compose
            .click()
            .await
            .context("failed to focus compose box")?;

        let script = insert_text_script(&self.selectors.compose_box, text)?;
        let inserted: bool = self
            .page
            .evaluate(script)
            .await
            .context("failed to insert reply text")?
            .into_value()
            .context("unexpected result from text insertion")?;
        if !inserted {
            bail!("compose box disappeared before the reply was inserted");
        }

        self.page
            .find_element(self.selectors.send_button.as_str())
            .await
            .context("send button not found")?
            .click()
            .await
            .context("failed to click send button")?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.handler_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

fn build_launch_config(config: &BrowserConfig) -> Result<LaunchConfig> {
    let mut builder = LaunchConfig::builder()
        .user_data_dir(&config.user_data_dir)
        .window_size(config.window_width, config.window_height)
        .no_sandbox()
        .arg("--disable-dev-shm-usage")
        .arg("--disable-gpu");
    if !config.headless {
        builder = builder.with_head();
    }
    if let Some(executable) = config.chrome_executable.as_ref() {
        builder = builder.chrome_executable(executable);
    }
    builder
        .build()
        .map_err(|err| anyhow!("invalid browser launch configuration: {err}"))
}

async fn close_browser(browser: &mut Browser) -> Result<()> {
    browser.close().await.context("failed to close browser")?;
    if let Err(err) = browser.wait().await {
        warn!(error = %err, "failed waiting for browser process to exit");
    }
    Ok(())
}

async fn chat_row_name(row: &Element, title_selector: &str) -> Result<Option<String>> {
    let title = row
        .find_element(title_selector)
        .await
        .context("chat row has no title element")?;
    let name = title
        .attribute("title")
        .await
        .context("failed to read chat title")?
        .map(|name| name.trim().to_owned())
        .filter(|name| !name.is_empty());
    Ok(name)
}

/// Replaces the compose box content through `insertText`, so newlines in the
/// reply do not act as Enter presses.
fn insert_text_script(compose_selector: &str, text: &str) -> Result<String> {
    let selector = serde_json::to_string(compose_selector).context("failed to encode selector")?;
    let text = serde_json::to_string(text).context("failed to encode reply text")?;
    Ok(format!(
        r#"(() => {{
    const el = document.querySelector({selector});
    if (!el) {{
        return false;
    }}
    el.focus();
    document.execCommand('selectAll', false, null);
    document.execCommand('delete', false, null);
    document.execCommand('insertText', false, {text});
    el.dispatchEvent(new InputEvent('input', {{ bubbles: true }}));
    return true;
}})()"#
    ))
}

fn filter_and_sort_chat_names(names: Vec<String>, query: Option<&str>) -> Vec<String> {
    let query = query
        .map(|value| value.trim().to_lowercase())
        .filter(|value| !value.is_empty());
    let mut chats: Vec<(String, String)> = names
        .into_iter()
        .map(|name| (name.to_lowercase(), name))
        .filter(|(lower, _)| query.as_ref().is_none_or(|q| lower.contains(q)))
        .collect();
    chats.sort_by(|left, right| left.0.cmp(&right.0).then(left.1.cmp(&right.1)));
    chats.dedup_by(|left, right| left.1 == right.1);
    chats.into_iter().map(|(_, name)| name).collect()
}

use std::{fmt, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, error, warn};

use super::Notifier;

// Used to escape characters in telegram messages.
// https://core.telegram.org/bots/api#markdownv2-style
pub fn escape_str(input: &str) -> String {
    let mut output = String::new();
    for c in input.chars() {
        match c {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '>' | '#' | '+' | '-' | '=' | '|'
            | '{' | '}' | '.' | '!' | '\\' => {
                output.push('\\');
            }
            _ => (),
        };
        output.push(c);
    }
    output
}

const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;
// Leave a little room for the escape characters and unknowns.
pub const TELEGRAM_SAFE_MESSAGE_LENGTH: usize = TELEGRAM_MAX_MESSAGE_LENGTH - 2048;

/// A message escaped for MarkdownV2 and cut to the character limit.
#[derive(Clone, Debug, PartialEq)]
pub struct TelegramSafeMessage(String);

impl TelegramSafeMessage {
    pub fn new(input: &str) -> Self {
        let escaped = escape_str(input);
        if escaped.chars().count() > TELEGRAM_SAFE_MESSAGE_LENGTH {
            warn!(
                "telegram message too long, truncating to {} characters",
                TELEGRAM_SAFE_MESSAGE_LENGTH
            );
            let mut truncated: String =
                escaped.chars().take(TELEGRAM_SAFE_MESSAGE_LENGTH).collect();
            // never end on a lone escape character
            if truncated.ends_with('\\') && !truncated.ends_with("\\\\") {
                truncated.pop();
            }
            Self(truncated)
        } else {
            Self(escaped)
        }
    }
}

impl fmt::Display for TelegramSafeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_key: String,
    chat_id: String,
    attempts: u32,
    retry_delay: Duration,
}

impl TelegramNotifier {
    pub fn new(api_key: String, chat_id: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            chat_id,
            attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }

    async fn send_message_request(&self, message: &TelegramSafeMessage) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.api_key);

        let json_body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": message.0,
            "parse_mode": "MarkdownV2",
            "disable_web_page_preview": true,
        });

        let response = self.client.post(&url).json(&json_body).send().await?;

        match response.status() {
            StatusCode::OK => {
                debug!(%message, "sent telegram message");
                Ok(())
            }
            StatusCode::BAD_REQUEST => {
                let body = response.text().await?;
                Err(anyhow!("failed to send telegram message: {}", body))
            }
            status => Err(anyhow!(
                "failed to send telegram message, status: {:?}",
                status
            )),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_notification(&self, text: &str) -> Result<()> {
        let message = TelegramSafeMessage::new(text);
        let mut last_err = anyhow!("telegram notifier configured with zero attempts");

        for attempt in 0..self.attempts {
            match self.send_message_request(&message).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    error!(attempt, %err, "failed to send telegram message");
                    last_err = err;
                    if attempt + 1 < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(last_err)
    }
}

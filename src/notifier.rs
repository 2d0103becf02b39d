//! Notifier (C8): best-effort outbound alerts. Never blocks trading: delivery failures are
//! logged and swallowed rather than back-pressuring the trading loop.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum NotifyEvent {
    OrderPlaced { account_id: String, instrument_id: String, broker_order_id: String, limit_price: String },
    OrderFilled { account_id: String, instrument_id: String, filled_qty: String, avg_fill_price: String },
    OrderFailed { account_id: String, instrument_id: String, reason: String },
    PollingDisabled { loop_name: String, consecutive_errors: u32 },
    DeltaBreach { account_id: String, instrument_id: String, observed_delta: String, threshold: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, channel: Option<&str>, event: &NotifyEvent);
}

/// Always present. Writes structured log lines in a dotted-field convention.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, channel: Option<&str>, event: &NotifyEvent) {
        let channel = channel.unwrap_or("default");
        match event {
            NotifyEvent::OrderPlaced { account_id, instrument_id, broker_order_id, limit_price } => {
                log::info!(
                    "notify.order_placed channel={channel} account={account_id} instrument={instrument_id} broker_order_id={broker_order_id} limit={limit_price}"
                );
            }
            NotifyEvent::OrderFilled { account_id, instrument_id, filled_qty, avg_fill_price } => {
                log::info!(
                    "notify.order_filled channel={channel} account={account_id} instrument={instrument_id} filled_qty={filled_qty} avg_fill_price={avg_fill_price}"
                );
            }
            NotifyEvent::OrderFailed { account_id, instrument_id, reason } => {
                log::warn!("notify.order_failed channel={channel} account={account_id} instrument={instrument_id} reason={reason}");
            }
            NotifyEvent::PollingDisabled { loop_name, consecutive_errors } => {
                log::error!("notify.polling_disabled channel={channel} loop={loop_name} consecutive_errors={consecutive_errors}");
            }
            NotifyEvent::DeltaBreach { account_id, instrument_id, observed_delta, threshold } => {
                log::warn!(
                    "notify.delta_breach channel={channel} account={account_id} instrument={instrument_id} observed_delta={observed_delta} threshold={threshold}"
                );
            }
        }
    }
}

/// Posts a JSON payload to a configured URL, standing in for the WeChat sink named
/// out-of-scope upstream. Only the interface is in scope, not a concrete wire format.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    max_retries: u32,
}

impl WebhookNotifier {
    pub fn new(url: String, timeout: Duration, max_retries: u32) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, url, max_retries }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, channel: Option<&str>, event: &NotifyEvent) {
        let body = serde_json::json!({ "channel": channel, "event": event });
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.post(&self.url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => {
                    log::warn!("notify.webhook_non_success status={} attempt={attempt}", resp.status());
                }
                Err(e) => {
                    log::warn!("notify.webhook_error attempt={attempt} err={e}");
                }
            }
            if attempt >= self.max_retries {
                log::error!("notify.webhook_gave_up attempts={attempt}");
                return;
            }
            tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
        }
    }
}

/// Fans out to every configured sink. Used when a webhook notifier is configured alongside
/// the always-on log notifier.
pub struct MultiNotifier {
    sinks: Vec<Box<dyn Notifier>>,
}

impl MultiNotifier {
    pub fn new(sinks: Vec<Box<dyn Notifier>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl Notifier for MultiNotifier {
    async fn notify(&self, channel: Option<&str>, event: &NotifyEvent) {
        for sink in &self.sinks {
            sink.notify(channel, event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_notifier_does_not_panic_on_any_event() {
        let notifier = LogNotifier;
        notifier
            .notify(
                Some("acct1"),
                &NotifyEvent::OrderFailed {
                    account_id: "acct1".to_string(),
                    instrument_id: "XYZ-1".to_string(),
                    reason: "rejected".to_string(),
                },
            )
            .await;
    }
}

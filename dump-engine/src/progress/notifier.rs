//! Push gateway for progress records.
//!
//! Delivery is best effort: the tracker logs and swallows every error a
//! notifier returns.

use super::ProgressRecord;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

/// Who a progress push is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyTarget {
    pub app_name: String,
    pub user_id: String,
}

#[async_trait]
pub trait ProgressNotifier: Send + Sync {
    async fn notify(&self, target: &NotifyTarget, file_name: &str, record: &ProgressRecord) -> anyhow::Result<()>;
}

/// Posts progress as JSON to an HTTP endpoint
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ProgressNotifier for HttpNotifier {
    async fn notify(&self, target: &NotifyTarget, file_name: &str, record: &ProgressRecord) -> anyhow::Result<()> {
        let body = json!({
            "appName": target.app_name,
            "userId": target.user_id,
            "type": "dump:progress",
            "payload": {
                "fileName": file_name,
                "percent": record.percent,
                "currentStep": record.current_step,
            },
        });

        let resp = self.client.post(&self.url).json(&body).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("push gateway responded with status {}", resp.status());
        }
        Ok(())
    }
}

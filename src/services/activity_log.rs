use crate::config::ActivityLogConfig;

/// Fire-and-forget HTTP sink for activity records.
///
/// Mutations log their activity after the fact; delivery of the log entry is
/// never awaited and never affects the caller's outcome.
#[derive(Clone)]
pub struct ActivityLogSink {
    client: reqwest::Client,
    url: Option<String>,
}

impl ActivityLogSink {
    pub fn new(config: &ActivityLogConfig) -> Self {
        ActivityLogSink {
            client: reqwest::Client::new(),
            url: config.url.clone(),
        }
    }

    /// Post an activity entry to the sink in the background. A missing sink
    /// URL disables logging entirely.
    pub fn log(&self, entry: serde_json::Value) {
        let Some(url) = self.url.clone() else {
            return;
        };
        let client = self.client.clone();

        tokio::spawn(async move {
            match client.post(&url).json(&entry).send().await {
                Ok(response) if !response.status().is_success() => {
                    tracing::warn!(
                        "Activity sink returned {} for log entry",
                        response.status()
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Failed to post activity log entry: {}", e);
                }
            }
        });
    }
}

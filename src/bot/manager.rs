//! Bot-manager exit callback
//!
//! When the bot terminates it POSTs its outcome to the manager URL
//! supplied at launch so the fleet controller can reconcile state.
//! Delivery is best-effort: a dead manager must not stop the bot from
//! exiting.

use std::time::Duration;

use serde::Serialize;

use crate::Result;

/// Exit code vocabulary shared with the bot manager.
pub mod exit_code {
    /// Normal completion or self-initiated leave
    pub const NORMAL: i32 = 0;
    /// Meeting admission failure (waiting room, rejection)
    pub const ADMISSION_FAILED: i32 = 2;
    /// SIGINT-driven shutdown
    pub const INTERRUPTED: i32 = 130;
    /// SIGTERM-driven shutdown
    pub const TERMINATED: i32 = 143;
    /// Any other fatal error
    pub const FATAL: i32 = 1;
}

#[derive(Serialize)]
struct ExitReport<'a> {
    connection_id: &'a str,
    exit_code: i32,
    reason: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<&'a str>,
}

/// Client for the manager callback endpoint.
pub struct ManagerClient {
    http: reqwest::Client,
    url: Option<String>,
    connection_id: String,
}

impl ManagerClient {
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be constructed.
    pub fn new(url: Option<String>, connection_id: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            url,
            connection_id: connection_id.into(),
        })
    }

    /// Report the bot's exit. Failures are logged and swallowed.
    pub async fn notify_exit(&self, exit_code: i32, reason: &str, error_details: Option<&str>) {
        let Some(url) = &self.url else {
            tracing::debug!("no manager URL configured, skipping exit callback");
            return;
        };

        let report = ExitReport {
            connection_id: &self.connection_id,
            exit_code,
            reason,
            error_details,
        };

        match self.http.post(url).json(&report).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(url, exit_code, reason, "exit reported to manager");
            }
            Ok(resp) => {
                tracing::warn!(url, status = %resp.status(), "manager rejected exit report");
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "exit report failed");
            }
        }
    }
}

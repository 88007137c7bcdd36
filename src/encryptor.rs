use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::wait::Deadline;

/// Port the encryptor appliance serves its status document on.
pub const STATUS_PORT: u16 = 80;

/// How long the appliance may go without reporting progress before the
/// run is declared stalled. Distinct from any overall timeout.
pub const PROGRESS_TIMEOUT: Duration = Duration::from_secs(600);

const SERVICE_UP_TIMEOUT: Duration = Duration::from_secs(600);
const SERVICE_UP_POLL: Duration = Duration::from_secs(5);
const STATUS_POLL: Duration = Duration::from_secs(10);
const STATUS_RETRY_SLEEP: Duration = Duration::from_secs(10);
const MAX_STATUS_ERRORS: u32 = 10;
// Operator-facing progress cadence, coarser than the poll cadence.
const OPERATOR_LOG_INTERVAL: Duration = Duration::from_secs(60);

pub const FAILURE_CODE_UNSUPPORTED_GUEST: &str = "unsupported_guest";
pub const FAILURE_CODE_AWS_PERMISSIONS: &str = "aws_permissions";
pub const FAILURE_CODE_INVALID_NTP_SERVERS: &str = "invalid_ntp_servers";

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionState {
    Initializing,
    Downloading,
    Encrypting,
    Successful,
    Failed,
}

impl fmt::Display for EncryptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EncryptionState::Initializing => "initializing",
            EncryptionState::Downloading => "downloading",
            EncryptionState::Encrypting => "encrypting",
            EncryptionState::Successful => "successful",
            EncryptionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One snapshot of agent-reported state, superseded by the next poll.
#[derive(Clone, Debug, Deserialize)]
pub struct EncryptorStatus {
    pub state: EncryptionState,
    #[serde(default)]
    pub percent_complete: u8,
    #[serde(default)]
    pub failure_code: Option<String>,
}

/// Status endpoint of a running encryptor appliance.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Fetch the current status document. Errors are treated as
    /// transient connectivity failures; the monitor budgets for them.
    async fn get_status(&self) -> Result<EncryptorStatus>;

    /// Whether the endpoint answers at all.
    async fn is_up(&self) -> bool;

    /// Endpoint description for log and error messages.
    fn endpoint(&self) -> String;
}

/// Polls `http://<host>:<port>/` over the candidate addresses of the
/// appliance, first answer wins.
pub struct HttpStatusSource {
    hosts: Vec<String>,
    port: u16,
    client: reqwest::Client,
}

impl HttpStatusSource {
    pub fn new(hosts: Vec<String>) -> Result<HttpStatusSource> {
        Self::with_port(hosts, STATUS_PORT)
    }

    pub fn with_port(hosts: Vec<String>, port: u16) -> Result<HttpStatusSource> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(HttpStatusSource {
            hosts,
            port,
            client,
        })
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn get_status(&self) -> Result<EncryptorStatus> {
        let mut last_err = None;
        for host in &self.hosts {
            let url = format!("http://{}:{}/", host, self.port);
            match self.client.get(&url).send().await {
                Ok(resp) => match resp.error_for_status() {
                    Ok(resp) => return Ok(resp.json::<EncryptorStatus>().await?),
                    Err(err) => last_err = Some(Error::Http(err)),
                },
                Err(err) => last_err = Some(Error::Http(err)),
            }
        }
        Err(last_err.unwrap_or(Error::ServiceUnavailable))
    }

    async fn is_up(&self) -> bool {
        self.get_status().await.is_ok()
    }

    fn endpoint(&self) -> String {
        format!("{} (port {})", self.hosts.join(", "), self.port)
    }
}

/// Wait until the status endpoint starts answering.
pub async fn wait_for_encryptor_up<C: Clock + ?Sized>(
    svc: &(impl StatusSource + ?Sized),
    clock: &C,
) -> Result<()> {
    let start = clock.now();
    let deadline = Deadline::new(SERVICE_UP_TIMEOUT, clock);
    while !deadline.is_expired(clock) {
        if svc.is_up().await {
            debug!(
                elapsed = ?(clock.now() - start),
                "encryption service is up"
            );
            return Ok(());
        }
        clock.sleep(SERVICE_UP_POLL).await;
    }
    warn!(endpoint = %svc.endpoint(), "unable to contact the encryption service");
    Err(Error::ServiceUnavailable)
}

/// Drive the remote encryption to a terminal state.
///
/// Polls the status document until the agent reports success or failure.
/// A rolling deadline guards against stalls: it resets whenever the
/// percentage grows or the state changes. Up to `MAX_STATUS_ERRORS`
/// consecutive fetch failures are retried with a fixed backoff; one more
/// means the appliance is gone.
pub async fn wait_for_encryption<C: Clock + ?Sized>(
    svc: &(impl StatusSource + ?Sized),
    clock: &C,
    progress_timeout: Duration,
) -> Result<()> {
    let mut err_count = 0;
    let mut last_log = clock.now();
    let mut progress_deadline = Deadline::new(progress_timeout, clock);
    let mut last_percent = 0;
    let mut last_state = None;

    while err_count < MAX_STATUS_ERRORS {
        let status = match svc.get_status().await {
            Ok(status) => {
                err_count = 0;
                status
            }
            Err(err) => {
                warn!(%err, "failed getting encryption status, retrying");
                err_count += 1;
                clock.sleep(STATUS_RETRY_SLEEP).await;
                continue;
            }
        };

        debug!(state = %status.state, percent = status.percent_complete, "encryption status");

        if progress_deadline.is_expired(clock) {
            return Err(Error::ProgressTimeout(progress_timeout));
        }
        if status.percent_complete > last_percent || Some(status.state) != last_state {
            last_percent = status.percent_complete;
            last_state = Some(status.state);
            progress_deadline = Deadline::new(progress_timeout, clock);
        }

        let now = clock.now();
        if now - last_log >= OPERATOR_LOG_INTERVAL {
            match status.state {
                EncryptionState::Initializing => info!("encryption process is initializing"),
                EncryptionState::Downloading => {
                    info!("download is {}% complete", status.percent_complete)
                }
                _ => info!("encryption is {}% complete", status.percent_complete),
            }
            last_log = now;
        }

        match status.state {
            EncryptionState::Successful => {
                info!("encrypted root volume created");
                return Ok(());
            }
            EncryptionState::Failed => {
                debug!(failure_code = ?status.failure_code);
                return Err(map_failure_code(status.failure_code.as_deref()));
            }
            _ => {}
        }

        clock.sleep(STATUS_POLL).await;
    }

    // MAX_STATUS_ERRORS consecutive failures, assume the appliance has
    // crashed.
    Err(Error::ServiceUnavailable)
}

/// Each known failure code maps to exactly one error kind; unknown
/// codes map to the generic encryption failure.
pub fn map_failure_code(code: Option<&str>) -> Error {
    match code {
        Some(FAILURE_CODE_UNSUPPORTED_GUEST) => Error::UnsupportedGuest,
        Some(FAILURE_CODE_AWS_PERMISSIONS) => Error::AwsPermissions,
        Some(FAILURE_CODE_INVALID_NTP_SERVERS) => Error::InvalidNtpServers,
        _ => Error::EncryptionFailed { console_log: None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::WallClock;
    use crate::test::ScriptedStatus;

    fn status(state: EncryptionState, percent: u8) -> EncryptorStatus {
        EncryptorStatus {
            state,
            percent_complete: percent,
            failure_code: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_successful_state() {
        let svc = ScriptedStatus::new(vec![
            Ok(status(EncryptionState::Initializing, 0)),
            Ok(status(EncryptionState::Encrypting, 40)),
            Ok(status(EncryptionState::Successful, 100)),
        ]);
        wait_for_encryption(&svc, &WallClock, PROGRESS_TIMEOUT)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_progress_times_out() {
        // Same state and percentage forever.
        let svc = ScriptedStatus::repeating(status(EncryptionState::Encrypting, 42));
        let err = wait_for_encryption(&svc, &WallClock, PROGRESS_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProgressTimeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn late_progress_resets_the_stall_deadline() {
        // 59 identical polls (10s apart) bring us just short of the
        // 600s stall deadline; one percent of progress then buys
        // another full window.
        let mut script: Vec<Result<EncryptorStatus>> = (0..59)
            .map(|_| Ok(status(EncryptionState::Encrypting, 42)))
            .collect();
        script.push(Ok(status(EncryptionState::Encrypting, 43)));
        script.push(Ok(status(EncryptionState::Encrypting, 43)));
        script.push(Ok(status(EncryptionState::Successful, 100)));
        let svc = ScriptedStatus::new(script);
        wait_for_encryption(&svc, &WallClock, PROGRESS_TIMEOUT)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn state_change_also_resets_the_stall_deadline() {
        let mut script: Vec<Result<EncryptorStatus>> = (0..59)
            .map(|_| Ok(status(EncryptionState::Downloading, 100)))
            .collect();
        script.extend((0..59).map(|_| Ok(status(EncryptionState::Encrypting, 0))));
        script.push(Ok(status(EncryptionState::Successful, 100)));
        let svc = ScriptedStatus::new(script);
        wait_for_encryption(&svc, &WallClock, PROGRESS_TIMEOUT)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn nine_transient_errors_are_survivable() {
        let mut script: Vec<Result<EncryptorStatus>> = (0..9)
            .map(|_| Err(Error::Api("connection refused".to_string())))
            .collect();
        script.push(Ok(status(EncryptionState::Successful, 100)));
        let svc = ScriptedStatus::new(script);
        wait_for_encryption(&svc, &WallClock, PROGRESS_TIMEOUT)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ten_consecutive_errors_are_fatal() {
        let script: Vec<Result<EncryptorStatus>> = (0..10)
            .map(|_| Err(Error::Api("connection refused".to_string())))
            .collect();
        let svc = ScriptedStatus::new(script);
        let err = wait_for_encryption(&svc, &WallClock, PROGRESS_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn error_budget_resets_on_success() {
        let mut script: Vec<Result<EncryptorStatus>> = Vec::new();
        for _ in 0..3 {
            script.extend((0..9).map(|_| Err(Error::Api("timeout".to_string()))));
            script.push(Ok(status(EncryptionState::Encrypting, 50)));
        }
        script.push(Ok(status(EncryptionState::Successful, 100)));
        let svc = ScriptedStatus::new(script);
        wait_for_encryption(&svc, &WallClock, PROGRESS_TIMEOUT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failure_codes_map_to_distinct_errors() {
        for (code, want) in [
            (FAILURE_CODE_UNSUPPORTED_GUEST, "UnsupportedGuest"),
            (FAILURE_CODE_AWS_PERMISSIONS, "AwsPermissions"),
            (FAILURE_CODE_INVALID_NTP_SERVERS, "InvalidNtpServers"),
            ("some_future_code", "EncryptionFailed"),
        ] {
            let svc = ScriptedStatus::new(vec![Ok(EncryptorStatus {
                state: EncryptionState::Failed,
                percent_complete: 0,
                failure_code: Some(code.to_string()),
            })]);
            let err = wait_for_encryption(&svc, &WallClock, PROGRESS_TIMEOUT)
                .await
                .unwrap_err();
            let got = match err {
                Error::UnsupportedGuest => "UnsupportedGuest",
                Error::AwsPermissions => "AwsPermissions",
                Error::InvalidNtpServers => "InvalidNtpServers",
                Error::EncryptionFailed { .. } => "EncryptionFailed",
                other => panic!("unexpected error {other:?}"),
            };
            assert_eq!(got, want, "failure code {code}");
        }
    }

    #[tokio::test]
    async fn missing_failure_code_maps_to_generic_failure() {
        let err = map_failure_code(None);
        assert!(matches!(err, Error::EncryptionFailed { console_log: None }));
    }

    #[test]
    fn status_document_deserializes() {
        let status: EncryptorStatus =
            serde_json::from_str(r#"{"state": "encrypting", "percent_complete": 57}"#).unwrap();
        assert_eq!(status.state, EncryptionState::Encrypting);
        assert_eq!(status.percent_complete, 57);
        assert!(status.failure_code.is_none());

        let status: EncryptorStatus = serde_json::from_str(
            r#"{"state": "failed", "percent_complete": 12, "failure_code": "aws_permissions"}"#,
        )
        .unwrap();
        assert_eq!(status.state, EncryptionState::Failed);
        assert_eq!(status.failure_code.as_deref(), Some("aws_permissions"));
    }
}

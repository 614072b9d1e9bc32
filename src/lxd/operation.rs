//! LXD background operations and the follower that waits on them

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::client::DaemonApi;
use crate::retry::retry;
use crate::{Error, Result};

/// Status reported by the daemon for a background operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum OperationStatus {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Success | OperationStatus::Failure | OperationStatus::Cancelled
        )
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "Pending"),
            OperationStatus::Running => write!(f, "Running"),
            OperationStatus::Success => write!(f, "Success"),
            OperationStatus::Failure => write!(f, "Failure"),
            OperationStatus::Cancelled => write!(f, "Cancelled"),
            OperationStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Progress payload of an operation, keyed by the field the daemon sets
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OperationMetadata {
    Download(String),
    Unpack(String),
    #[default]
    Empty,
}

const DOWNLOAD_KEY: &str = "download_progress";
const UNPACK_KEYS: [&str; 2] = [
    "create_instance_from_image_unpack_progress",
    "create_container_from_image_unpack_progress",
];

impl OperationMetadata {
    pub fn from_value(value: Option<&serde_json::Value>) -> Self {
        let Some(map) = value.and_then(|v| v.as_object()) else {
            return OperationMetadata::Empty;
        };

        if let Some(progress) = map.get(DOWNLOAD_KEY).and_then(|v| v.as_str()) {
            return OperationMetadata::Download(progress.to_string());
        }

        UNPACK_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(|v| v.as_str()))
            .map(|progress| OperationMetadata::Unpack(progress.to_string()))
            .unwrap_or(OperationMetadata::Empty)
    }
}

/// Renders one line of progress from the current metadata
pub type ProgressUnpacker = fn(&OperationMetadata) -> String;

/// Progress renderer for image pull operations
pub fn image_progress(metadata: &OperationMetadata) -> String {
    match metadata {
        OperationMetadata::Download(progress) => format!("Download progress: {}", progress),
        OperationMetadata::Unpack(progress) => format!("Unpack progress: {}", progress),
        OperationMetadata::Empty => String::new(),
    }
}

/// Snapshot of a daemon operation
#[derive(Debug, Clone)]
pub struct Operation {
    pub uri: String,
    pub id: String,
    pub description: String,
    pub status: OperationStatus,
    pub status_code: u16,
    pub metadata: OperationMetadata,
    pub err: String,
}

#[derive(Debug, Deserialize)]
struct OperationRecord {
    #[serde(default)]
    id: String,
    #[serde(default)]
    description: String,
    status: OperationStatus,
    #[serde(default)]
    status_code: u16,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
    #[serde(default)]
    err: String,
}

impl Operation {
    /// Build from the `metadata` field of a `GET /1.0/operations/<id>` response
    pub fn from_value(uri: &str, value: serde_json::Value) -> Result<Self> {
        let record: OperationRecord = serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("operation {}: {}", uri, e)))?;

        Ok(Self {
            uri: uri.to_string(),
            id: record.id,
            description: record.description,
            status: record.status,
            status_code: record.status_code,
            metadata: OperationMetadata::from_value(record.metadata.as_ref()),
            err: record.err,
        })
    }
}

/// Cooperative cancellation flag, checked by the follower between polls.
///
/// The token is armed only while a follower is polling. An interrupt handler
/// should cancel an armed token and abort the process otherwise.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    armed: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// True while some follower is polling and will observe `cancel`
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Handle an interrupt: cancel a polling follower and return true, or
    /// return false when nothing would observe the cancellation (not armed,
    /// or already cancelled once) and the caller should abort instead.
    pub fn interrupt(&self) -> bool {
        if self.is_armed() && !self.is_cancelled() {
            self.cancel();
            true
        } else {
            false
        }
    }

    /// Arm the token until the returned guard is dropped
    pub fn arm(&self) -> ArmedGuard {
        self.armed.store(true, Ordering::SeqCst);
        ArmedGuard {
            token: self.clone(),
        }
    }
}

/// Disarms its [`CancelToken`] on drop
#[derive(Debug)]
pub struct ArmedGuard {
    token: CancelToken,
}

impl Drop for ArmedGuard {
    fn drop(&mut self) {
        self.token.armed.store(false, Ordering::SeqCst);
    }
}

/// Where the follower is in its state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowPhase {
    AwaitingCreation,
    Polling,
    Terminal,
}

/// How a follow ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowOutcome {
    Completed,
    Interrupted,
}

/// Timing for the follower
#[derive(Debug, Clone)]
pub struct FollowerConfig {
    /// Lookups made before giving up on an operation that never appears
    pub creation_attempts: u32,
    /// Delay between creation lookups
    pub creation_delay: Duration,
    /// Delay between polls once the operation is visible
    pub poll_interval: Duration,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self {
            creation_attempts: 10,
            creation_delay: Duration::from_millis(500),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl FollowerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn creation_attempts(mut self, attempts: u32) -> Self {
        self.creation_attempts = attempts;
        self
    }

    pub fn creation_delay(mut self, delay: Duration) -> Self {
        self.creation_delay = delay;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Waits for a daemon operation to finish, rendering progress as it goes
pub struct OperationFollower<'a, D: DaemonApi + ?Sized> {
    api: &'a D,
    config: FollowerConfig,
    cancel: CancelToken,
    phase: FollowPhase,
}

impl<'a, D: DaemonApi + ?Sized> OperationFollower<'a, D> {
    pub fn new(api: &'a D, config: FollowerConfig, cancel: CancelToken) -> Self {
        Self {
            api,
            config,
            cancel,
            phase: FollowPhase::AwaitingCreation,
        }
    }

    pub fn phase(&self) -> FollowPhase {
        self.phase
    }

    /// Follow `uri` to completion, printing to stdout
    pub fn follow(&mut self, uri: &str, unpacker: Option<ProgressUnpacker>) -> Result<FollowOutcome> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        self.follow_with_output(uri, unpacker, &mut out)
    }

    /// Follow `uri` to completion, writing the description, progress and
    /// completion marker to `out`.
    pub fn follow_with_output(
        &mut self,
        uri: &str,
        unpacker: Option<ProgressUnpacker>,
        out: &mut dyn Write,
    ) -> Result<FollowOutcome> {
        self.phase = FollowPhase::AwaitingCreation;
        let mut operation = self.await_creation(uri)?;

        self.phase = FollowPhase::Polling;
        let _armed = self.cancel.arm();
        writeln!(out, "{}", operation.description)?;
        let mut rendered = false;

        loop {
            if self.cancel.is_cancelled() {
                if rendered {
                    writeln!(out)?;
                }
                tracing::info!(operation = %uri, "Stopped following operation; it continues on the daemon");
                return Ok(FollowOutcome::Interrupted);
            }

            if let Some(unpack) = unpacker {
                let line = unpack(&operation.metadata);
                write!(out, "\r\x1b[2K{}", line)?;
                out.flush()?;
                rendered = true;
            }

            if operation.status.is_terminal() {
                self.phase = FollowPhase::Terminal;
                if rendered {
                    writeln!(out)?;
                }
                match operation.status {
                    OperationStatus::Failure => {
                        return Err(Error::Api(format!(
                            "operation {} failed: {}",
                            uri, operation.err
                        )));
                    }
                    OperationStatus::Cancelled => {
                        return Err(Error::Api(format!("operation {} was cancelled", uri)));
                    }
                    _ => break,
                }
            }

            std::thread::sleep(self.config.poll_interval);

            match self.api.get_operation(uri) {
                Ok(next) => operation = next,
                // The daemon drops finished operations, so disappearing
                // while polling means the work is done.
                Err(e) if e.is_not_found() => {
                    self.phase = FollowPhase::Terminal;
                    if rendered {
                        writeln!(out)?;
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        writeln!(out, "Done.")?;
        Ok(FollowOutcome::Completed)
    }

    fn await_creation(&self, uri: &str) -> Result<Operation> {
        let lookup = retry(
            self.config.creation_attempts,
            self.config.creation_delay,
            "operation lookup",
            || match self.api.get_operation(uri) {
                Ok(op) => Ok(Ok(op)),
                Err(e) if e.is_not_found() => Err(e),
                Err(e) => Ok(Err(e)),
            },
        );

        match lookup {
            Ok(found) => found,
            Err(_) => Err(Error::Timeout(format!(
                "timed out while waiting for operation {} to be created",
                uri
            ))),
        }
    }
}

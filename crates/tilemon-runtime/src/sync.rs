//! [`SynchronizationCoordinator`] – aligned acquisition start across boards.
//!
//! 1. Pick a start time `lead_time` ahead of now, rounded up to the next
//!    multiple of `alignment` (whole Unix seconds, so it falls on a PPS
//!    edge).
//! 2. Send `StartAcquisition{start_time, delay}` to every board in parallel.
//! 3. Follow each board's programming state until it is `SYNCHRONISED`, the
//!    board faults, or the group timeout elapses. The timeout bounds the
//!    whole per-board sequence, start command included.
//!
//! The report names the boards that did not make it. Boards that did are
//! left as they are.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tilemon_kernel::programming::IS_SYNCHRONISED;
use tilemon_types::{CommandStatus, DeviceId, ProgrammingState, TileError};
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{info, instrument, warn};

use crate::executor::CommandExecutor;
use crate::poller::PollerHandle;
use crate::programming::ProgrammingMonitor;

pub const START_ACQUISITION: &str = "StartAcquisition";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub lead_time_ms: u64,
    /// Start times are multiples of this; whole seconds only.
    pub alignment_ms: u64,
    /// Budget for the whole group to reach `SYNCHRONISED`.
    pub group_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Optional `delay` parameter of `StartAcquisition`.
    pub delay: Option<u32>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lead_time_ms: 2_000,
            alignment_ms: 1_000,
            group_timeout_ms: 30_000,
            poll_interval_ms: 500,
            delay: None,
        }
    }
}

impl SyncConfig {
    /// # Errors
    ///
    /// [`TileError::Configuration`] when the alignment is not a positive
    /// whole number of seconds or the poll interval is zero.
    pub fn validate(&self) -> Result<(), TileError> {
        if self.alignment_ms == 0 || self.alignment_ms % 1_000 != 0 {
            return Err(TileError::Configuration(format!(
                "sync alignment_ms must be a positive multiple of 1000, got {}",
                self.alignment_ms
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(TileError::Configuration("sync poll_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn group_timeout(&self) -> Duration {
        Duration::from_millis(self.group_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// `ceil((now + lead) / alignment) * alignment`, in Unix seconds.
///
/// # Example
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use tilemon_runtime::sync::aligned_start_time;
///
/// let now = Utc.timestamp_millis_opt(1_700_000_000_300).unwrap();
/// assert_eq!(aligned_start_time(now, 2_000, 1_000), 1_700_000_003);
/// ```
pub fn aligned_start_time(now: DateTime<Utc>, lead_time_ms: u64, alignment_ms: u64) -> i64 {
    let lead = i64::try_from(lead_time_ms).unwrap_or(i64::MAX);
    let align = i64::try_from(alignment_ms.max(1_000)).unwrap_or(i64::MAX);
    let earliest = now.timestamp_millis().saturating_add(lead);
    let slots = earliest.div_euclid(align) + i64::from(earliest.rem_euclid(align) != 0);
    slots.saturating_mul(align) / 1_000
}

/// Outcome of one synchronisation round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Unix seconds.
    pub start_time: i64,
    pub synchronised: Vec<DeviceId>,
    /// Boards that did not synchronise, with the reason.
    pub failed: Vec<(DeviceId, String)>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_boards(&self) -> Vec<&DeviceId> {
        self.failed.iter().map(|(id, _)| id).collect()
    }
}

pub struct SynchronizationCoordinator {
    executor: CommandExecutor,
    monitor: Arc<ProgrammingMonitor>,
    pollers: PollerHandle,
    config: SyncConfig,
}

impl SynchronizationCoordinator {
    pub fn new(
        executor: CommandExecutor,
        monitor: Arc<ProgrammingMonitor>,
        pollers: PollerHandle,
        config: SyncConfig,
    ) -> Self {
        Self {
            executor,
            monitor,
            pollers,
            config,
        }
    }

    /// Start acquisition on `boards` at a common aligned time.
    #[instrument(skip_all, fields(boards = boards.len()))]
    pub async fn synchronise(&self, boards: &[DeviceId]) -> SyncReport {
        let start_time =
            aligned_start_time(Utc::now(), self.config.lead_time_ms, self.config.alignment_ms);
        let deadline = Instant::now() + self.config.group_timeout();
        info!(start_time, "synchronising boards");

        let outcomes = join_all(boards.iter().map(|board| async move {
            let outcome = timeout_at(deadline, self.start_board(board, start_time, deadline))
                .await
                .unwrap_or_else(|_| Err(self.late()));
            (board, outcome)
        }))
        .await;

        let mut report = SyncReport {
            start_time,
            synchronised: Vec::new(),
            failed: Vec::new(),
        };
        for (board, outcome) in outcomes {
            match outcome {
                Ok(()) => report.synchronised.push(board.clone()),
                Err(why) => {
                    warn!(%board, %why, "board did not synchronise");
                    report.failed.push((board.clone(), why));
                }
            }
        }
        report
    }

    fn late(&self) -> String {
        format!("not SYNCHRONISED within {} ms", self.config.group_timeout_ms)
    }

    async fn start_board(&self, board: &DeviceId, start_time: i64, deadline: Instant) -> Result<(), String> {
        let mut params = serde_json::json!({ "start_time": start_time });
        if let Some(delay) = self.config.delay {
            params["delay"] = delay.into();
        }
        let handle = self
            .executor
            .submit(board, START_ACQUISITION, params)
            .await
            .map_err(|e| e.to_string())?;
        let status = self.executor.wait(&handle).await.map_err(|e| e.to_string())?;
        if status != CommandStatus::Completed {
            let detail = self
                .executor
                .task(&handle)
                .and_then(|task| task.error)
                .unwrap_or_else(|| format!("{status:?}"));
            return Err(format!("{START_ACQUISITION} did not complete: {detail}"));
        }

        let watched = [IS_SYNCHRONISED.to_string()];
        loop {
            match self.monitor.state(board) {
                Some(ProgrammingState::Synchronised) => return Ok(()),
                Some(ProgrammingState::Fault) => {
                    let cause = self
                        .monitor
                        .status(board)
                        .and_then(|s| s.fault_cause)
                        .unwrap_or_else(|| "fault".to_string());
                    return Err(format!("board entered FAULT: {cause}"));
                }
                None => return Err(TileError::UnknownDevice(board.clone()).to_string()),
                Some(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(self.late());
            }
            self.pollers.force_poll(board, &watched);
            sleep(self.config.poll_interval()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    #[test]
    fn start_time_rounds_up_to_alignment() {
        assert_eq!(aligned_start_time(at(1_000_000_000), 2_000, 1_000), 1_000_002);
        assert_eq!(aligned_start_time(at(1_000_000_001), 2_000, 1_000), 1_000_003);
        assert_eq!(aligned_start_time(at(1_000_000_999), 2_000, 1_000), 1_000_003);
    }

    #[test]
    fn coarser_alignment() {
        // 1_000_003.5 s rounded up to a multiple of 8 s.
        assert_eq!(aligned_start_time(at(1_000_001_500), 2_000, 8_000), 1_000_008);
    }

    #[test]
    fn alignment_must_be_whole_seconds() {
        let config = SyncConfig {
            alignment_ms: 1_500,
            ..SyncConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(SyncConfig::default().validate().is_ok());
    }
}

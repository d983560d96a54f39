//! Session lifecycle.
//!
//! Process-wide for the lifetime of one backup run: created by the
//! orchestrator at job start, sealed exactly once on exit.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub status: SessionStatus,
    /// Ambient field used only by the CLI/logging layer, not by any core
    /// invariant — written into the source tag marker (§6.2) and the final
    /// log line.
    pub app_version: &'static str,
    sealed: bool,
}

impl Session {
    pub fn start() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at: Utc::now(),
            status: SessionStatus::Running,
            app_version: env!("CARGO_PKG_VERSION"),
            sealed: false,
        }
    }

    /// Seals the session exactly once; panics on a double-seal, which would
    /// indicate an orchestrator invariant violation.
    pub fn seal(&mut self, status: SessionStatus) {
        assert!(!self.sealed, "session already sealed");
        self.status = status;
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }
}

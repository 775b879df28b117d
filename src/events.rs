//! Marathon status-update event handling.
//!
//! A RUNNING event deliberately re-syncs the whole app instead of
//! registering the single task: labels discovered late and tasks started
//! concurrently converge in the same pass. Terminal events stay light and
//! deregister exactly one service id. Events are not serialized against
//! each other; a stale registration left by an out-of-order terminal event
//! is removed by the next purge.

use serde::Deserialize;
use tracing::warn;

use crate::errors::BridgeError;
use crate::sync::Syncer;

/// Body of a `status_update_event` posted by Marathon.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateEvent {
    pub task_status: String,
    pub app_id: String,
    pub task_id: String,
    pub host: String,
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl Syncer {
    /// Applies one task-lifecycle event to the catalog.
    pub async fn handle_status_update(&self, event: &StatusUpdateEvent) -> Result<(), BridgeError> {
        match event.task_status.as_str() {
            "TASK_STAGING" | "TASK_STARTING" => Ok(()),
            "TASK_RUNNING" => {
                let app = self.marathon.get_app(&event.app_id).await?;
                self.sync_app(&app).await
            }
            "TASK_FINISHED" | "TASK_FAILED" | "TASK_KILLED" | "TASK_LOST" => {
                let agent = self.consul.agent_endpoint(&event.host);
                self.consul.deregister_service(&agent, &event.task_id).await
            }
            other => {
                // Marathon grows new task states over time; none of them
                // have catalog effects until this table says so.
                warn!(task_status = %other, task = %event.task_id, "ignoring unhandled task status");
                Ok(())
            }
        }
    }
}

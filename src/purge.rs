//! Purge of catalog state whose Marathon counterpart is gone.
//!
//! The service scan walks every node's local agent, considers only services
//! carrying this instance's reg-id tag, correlates them back to their app
//! through the app-id tag, and deregisters those whose task id is no longer
//! in the app's task list. An app that no longer exists at all counts as an
//! empty task list, so its leftover services are removed the same way.

use std::collections::{HashMap, HashSet};

use futures::future;
use tracing::{error, info, warn};

use crate::errors::BridgeError;
use crate::marathon::App;
use crate::sync::{app_name, first_error, Syncer, KV_PREFIX};
use crate::tags::{app_id_from_tags, matches_reg_id};

impl Syncer {
    /// Scans every cluster node's agent for orphaned services owned by
    /// this instance and deregisters them.
    pub async fn purge_dead_services(&self) -> Result<(), BridgeError> {
        let nodes = self.consul.nodes().await?;
        let results = future::join_all(
            nodes
                .iter()
                .map(|node| self.purge_dead_agent_services(self.consul.agent_endpoint(&node.address))),
        )
        .await;
        first_error(results)
    }

    /// Purges one agent: group this instance's services by app id, then
    /// check each group against the app's live tasks.
    async fn purge_dead_agent_services(&self, agent: String) -> Result<(), BridgeError> {
        let services = self.consul.agent_services(&agent).await?;

        let mut by_app: HashMap<String, Vec<String>> = HashMap::new();
        for service in services.values() {
            let tags = service.tags.as_deref().unwrap_or_default();
            if !matches_reg_id(tags, &self.registration_id) {
                continue;
            }
            match app_id_from_tags(&service.id, tags) {
                Ok(Some(app_id)) => by_app.entry(app_id).or_default().push(service.id.clone()),
                Ok(None) => {
                    warn!(
                        service = %service.id,
                        agent = %agent,
                        "owned service has no app-id tag, cannot correlate, skipping"
                    );
                }
                Err(err) => {
                    error!(service = %service.id, agent = %agent, error = %err, "skipping service");
                }
            }
        }

        let results = future::join_all(
            by_app
                .iter()
                .map(|(app_id, service_ids)| self.purge_service_if_dead(&agent, app_id, service_ids)),
        )
        .await;
        first_error(results)
    }

    /// Deregisters every service in the group whose id is not among the
    /// app's current task ids. A missing app yields an empty task set, so
    /// all of its services are considered dead.
    async fn purge_service_if_dead(
        &self,
        agent: &str,
        app_id: &str,
        service_ids: &[String],
    ) -> Result<(), BridgeError> {
        let tasks = self.marathon.get_app_tasks_or_empty(app_id).await?;
        let live: HashSet<&str> = tasks.iter().map(|task| task.id.as_str()).collect();

        let deregistrations = service_ids
            .iter()
            .filter(|service_id| !live.contains(service_id.as_str()))
            .map(|service_id| async move {
                info!(
                    service = %service_id,
                    app = %app_id,
                    agent = %agent,
                    "deregistering service without matching task"
                );
                self.consul.deregister_service(agent, service_id).await
            });
        first_error(future::join_all(deregistrations).await)
    }

    /// Deletes the label subtree of every app name under `consular/` that
    /// no current app maps to.
    pub async fn purge_dead_app_labels(&self, apps: &[App]) -> Result<(), BridgeError> {
        let live: HashSet<String> = apps.iter().map(|app| app_name(&app.id)).collect();

        let prefix = format!("{}/", KV_PREFIX);
        let entries = self.consul.kv_keys(&prefix, Some("/")).await?;

        let deletes = entries.iter().filter_map(|entry| {
            let name = entry.strip_prefix(prefix.as_str())?.trim_end_matches('/');
            if name.is_empty() || live.contains(name) {
                return None;
            }
            Some(async move {
                info!(app_name = %name, "deleting label subtree of unknown app");
                self.consul.delete_kv(entry, true).await
            })
        });
        first_error(future::join_all(deletes).await)
    }
}

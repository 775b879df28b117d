//! Full reconciliation between Marathon and Consul.
//!
//! A sync lists every app, checks that no two apps collapse to the same
//! Consul service name, then fans out over all apps: each app's labels are
//! mirrored into the KV store while its tasks are registered at their
//! node-local agents. With purge enabled the dead-service and dead-label
//! scans run alongside the per-app work. Sub-operations are unordered with
//! respect to each other; every sibling runs to completion and the first
//! error (if any) is reported once all have settled.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future;
use tracing::{info, warn};

use crate::consul::{ConsulClient, ServiceRegistration};
use crate::errors::{BridgeError, NameClash};
use crate::marathon::{App, MarathonClient, Task};
use crate::tags::{app_id_tag, reg_id_tag};

/// Prefix of the KV subtree owned by the bridge. Keys outside it are never
/// touched.
pub const KV_PREFIX: &str = "consular";

/// Derives the Consul service name from a Marathon app id: the leading `/`
/// is dropped and interior `/` become `-`.
pub fn app_name(app_id: &str) -> String {
    app_id.trim_start_matches('/').replace('/', "-")
}

/// Returns all groups of apps that share a service name, sorted by name.
fn name_clashes(apps: &[App]) -> Vec<NameClash> {
    let mut by_name: HashMap<String, Vec<String>> = HashMap::new();
    for app in apps {
        by_name
            .entry(app_name(&app.id))
            .or_default()
            .push(app.id.clone());
    }

    let mut clashes: Vec<NameClash> = by_name
        .into_iter()
        .filter(|(_, app_ids)| app_ids.len() > 1)
        .map(|(app_name, app_ids)| NameClash { app_name, app_ids })
        .collect();
    clashes.sort_by(|a, b| a.app_name.cmp(&b.app_name));
    clashes
}

/// Reduces fan-out results to the first error after all siblings settled.
pub(crate) fn first_error(results: Vec<Result<(), BridgeError>>) -> Result<(), BridgeError> {
    results.into_iter().collect()
}

/// Drives reconciliation and event-driven updates against both systems.
pub struct Syncer {
    pub(crate) marathon: Arc<MarathonClient>,
    pub(crate) consul: Arc<ConsulClient>,
    pub(crate) registration_id: String,
}

impl Syncer {
    pub fn new(
        marathon: Arc<MarathonClient>,
        consul: Arc<ConsulClient>,
        registration_id: String,
    ) -> Self {
        Self {
            marathon,
            consul,
            registration_id,
        }
    }

    /// Reconciles every app, and with `purge` set also removes catalog
    /// state with no Marathon counterpart. Aborts before any write when two
    /// apps map to the same service name.
    pub async fn sync_apps(&self, purge: bool) -> Result<(), BridgeError> {
        let apps = self.marathon.get_apps().await?;

        let clashes = name_clashes(&apps);
        if !clashes.is_empty() {
            return Err(BridgeError::NamespaceClash { clashes });
        }

        info!(apps = apps.len(), purge = purge, "starting full sync");

        let app_syncs = future::join_all(apps.iter().map(|app| self.sync_app(app)));
        let service_purge = async {
            if purge {
                self.purge_dead_services().await
            } else {
                Ok(())
            }
        };
        let label_purge = async {
            if purge {
                self.purge_dead_app_labels(&apps).await
            } else {
                Ok(())
            }
        };

        let (app_results, service_result, label_result) =
            future::join3(app_syncs, service_purge, label_purge).await;
        first_error(app_results)
            .and(service_result)
            .and(label_result)
    }

    /// Mirrors one app's labels and registers its tasks, concurrently.
    pub async fn sync_app(&self, app: &App) -> Result<(), BridgeError> {
        let (labels, tasks) =
            future::join(self.sync_app_labels(app), self.sync_app_tasks(app)).await;
        labels.and(tasks)
    }

    /// Writes the app's labels under `consular/<app-name>/` and deletes
    /// keys in that subtree that no longer correspond to a label. Put and
    /// clean run concurrently: a key being deleted cannot be one being
    /// written, so ordering between the phases does not matter.
    async fn sync_app_labels(&self, app: &App) -> Result<(), BridgeError> {
        let name = app_name(&app.id);
        let prefix = format!("{}/{}/", KV_PREFIX, name);

        let puts = future::join_all(app.labels.iter().map(|(label_key, value)| {
            let key = format!("{}{}", prefix, label_key);
            async move { self.consul.put_kv(&key, value).await }
        }));

        let clean = async {
            let keys = self.consul.kv_keys(&prefix, None).await?;
            let deletes = keys.iter().filter_map(|key| {
                let label_key = key.strip_prefix(&prefix)?;
                if app.labels.contains_key(label_key) {
                    None
                } else {
                    Some(async move { self.consul.delete_kv(key, false).await })
                }
            });
            first_error(future::join_all(deletes).await)
        };

        let (put_results, clean_result) = future::join(puts, clean).await;
        first_error(put_results).and(clean_result)
    }

    /// Registers every current task of the app at its node-local agent.
    async fn sync_app_tasks(&self, app: &App) -> Result<(), BridgeError> {
        let tasks = self.marathon.get_app_tasks(&app.id).await?;
        let results =
            future::join_all(tasks.iter().map(|task| self.register_task(app, task))).await;
        first_error(results)
    }

    /// Registers a single task as a Consul service carrying both ownership
    /// tags. Registration is keyed by task id, so replaying is idempotent.
    pub(crate) async fn register_task(&self, app: &App, task: &Task) -> Result<(), BridgeError> {
        let Some(port) = task.ports.first() else {
            warn!(task = %task.id, app = %app.id, "task has no ports, skipping registration");
            return Ok(());
        };

        let registration = ServiceRegistration {
            name: app_name(&app.id),
            id: task.id.clone(),
            address: task.host.clone(),
            port: *port,
            tags: vec![
                reg_id_tag(&self.registration_id),
                app_id_tag(&app.id),
            ],
        };

        let agent = self.consul.agent_endpoint(&task.host);
        self.consul.register_service(&agent, &registration).await
    }
}

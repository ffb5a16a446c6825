//! The switchboard of live environments: creation, lookup,
//! exactly-once destruction, and the live count the idle supervisor
//! watches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use camino::Utf8PathBuf;
use rig_api::events::{Event, EventType};
use rig_api::models::{DestroyResponse, LogHeader, Outcome};
use rig_api::spec::EnvironmentSpec;
use tokio::sync::watch;
use tracing::info;
use utils::id::EnvironmentId;

use crate::environment::{Environment, EnvironmentDeps};

pub enum CreateError {
    Validation(Vec<String>),
    Internal(anyhow::Error),
}

pub struct EnvironmentMgr {
    deps: EnvironmentDeps,
    environments: Mutex<HashMap<EnvironmentId, Arc<Environment>>>,
    live: watch::Sender<usize>,
}

impl EnvironmentMgr {
    pub fn new(deps: EnvironmentDeps) -> Arc<Self> {
        let (live, _) = watch::channel(0);
        Arc::new(EnvironmentMgr {
            deps,
            environments: Mutex::new(HashMap::new()),
            live,
        })
    }

    /// Validate and start an environment. Orchestration runs in the
    /// background; the caller gets the id immediately and follows the
    /// event stream for everything else.
    pub fn create(&self, spec: EnvironmentSpec) -> Result<Arc<Environment>, CreateError> {
        let errors = spec.validate(&self.deps.types.known_tags());
        if !errors.is_empty() {
            return Err(CreateError::Validation(errors));
        }

        let environment =
            Environment::create(self.deps.clone(), spec).map_err(CreateError::Internal)?;
        let count = {
            let mut environments = self.environments.lock().unwrap();
            environments.insert(environment.id(), Arc::clone(&environment));
            environments.len()
        };
        self.live.send_replace(count);
        info!("created environment {} ({count} live)", environment.id());
        Ok(environment)
    }

    pub fn get(&self, id: EnvironmentId) -> Option<Arc<Environment>> {
        self.environments.lock().unwrap().get(&id).cloned()
    }

    /// Remove, cancel, and wind down one environment. The removal from
    /// the map is the linearization point: of N concurrent destroys
    /// exactly one gets the environment, the rest see None.
    pub async fn destroy(&self, id: EnvironmentId, persist_log: bool) -> Option<DestroyResponse> {
        let environment = self.environments.lock().unwrap().remove(&id)?;

        environment
            .log()
            .publish(Event::new(EventType::EnvironmentDestroying));
        environment.cancel();
        let outcome = environment
            .wait_terminal()
            .await
            .unwrap_or(Outcome::Crashed);

        let log_file = if persist_log {
            match self.write_log_file(&environment, outcome) {
                Ok(path) => Some(path.to_string()),
                Err(e) => {
                    tracing::warn!("failed to persist log for {id}: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        let count = self.environments.lock().unwrap().len();
        self.live.send_replace(count);
        info!("destroyed environment {id} ({count} live)");

        Some(DestroyResponse {
            id,
            status: "destroyed".to_string(),
            log_file,
        })
    }

    /// JSONL: one `log.header` line, then every event in seq order.
    fn write_log_file(
        &self,
        environment: &Environment,
        outcome: Outcome,
    ) -> anyhow::Result<Utf8PathBuf> {
        use std::io::Write;

        let logs_dir = self.deps.conf.logs_dir();
        std::fs::create_dir_all(&logs_dir)?;
        let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        let path = logs_dir.join(format!("{timestamp}-{}.jsonl", environment.handle.name));

        let header = LogHeader::new(
            environment.handle.name.clone(),
            outcome,
            environment.spec.services.keys().cloned().collect(),
            environment.created_at.elapsed().as_millis() as u64,
        );
        let mut file = std::io::BufWriter::new(
            std::fs::File::create(&path).with_context(|| format!("create {path}"))?,
        );
        serde_json::to_writer(&mut file, &header)?;
        file.write_all(b"\n")?;
        for event in environment.log().events() {
            serde_json::to_writer(&mut file, &event)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        Ok(path)
    }

    /// Observed by the idle-shutdown supervisor.
    pub fn live_count(&self) -> watch::Receiver<usize> {
        self.live.subscribe()
    }

    /// Graceful daemon shutdown: wind down whatever is still running.
    pub async fn destroy_all(&self) {
        let ids: Vec<EnvironmentId> = self.environments.lock().unwrap().keys().copied().collect();
        for id in ids {
            self.destroy(id, false).await;
        }
    }
}

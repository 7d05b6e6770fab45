//! Host routing.
//!
//! When runners are registered, new sandboxes go to the live runner with
//! the most free slots; otherwise the coordinator hosts them locally
//! (standalone mode). Existing sessions route to their owning runner until
//! it dies, at which point resume reassigns via the cold path.

use std::sync::Arc;

use crate::runner::registry::{RunnerRegistry, SelectOutcome};
use crate::runner::remote::RemoteHost;
use crate::session::node::{HostError, LocalHost, SandboxHost};

/// Routes sandbox work to this node or to runners.
pub struct HostRouter {
    local: Option<Arc<LocalHost>>,
    registry: Arc<RunnerRegistry>,
    internal_secret: Option<String>,
}

impl HostRouter {
    pub fn new(
        local: Option<Arc<LocalHost>>,
        registry: Arc<RunnerRegistry>,
        internal_secret: Option<String>,
    ) -> Self {
        Self {
            local,
            registry,
            internal_secret,
        }
    }

    pub fn registry(&self) -> &Arc<RunnerRegistry> {
        &self.registry
    }

    pub fn local(&self) -> Option<&Arc<LocalHost>> {
        self.local.as_ref()
    }

    fn remote(&self, base_url: String) -> Arc<dyn SandboxHost> {
        Arc::new(RemoteHost::new(base_url, self.internal_secret.clone()))
    }

    /// Pick a home for a new sandbox: `(runner_id, host)`, runner_id `None`
    /// for coordinator-local execution.
    pub async fn select_home(
        &self,
    ) -> Result<(Option<String>, Arc<dyn SandboxHost>), HostError> {
        let outcome = self
            .registry
            .select()
            .await
            .map_err(|e| HostError::Internal(e.to_string()))?;

        match outcome {
            SelectOutcome::Chosen(runner) => {
                let host = self.remote(runner.base_url());
                Ok((Some(runner.id), host))
            }
            SelectOutcome::AllFull => Err(HostError::CapacityExceeded),
            SelectOutcome::NoRunners => match &self.local {
                Some(local) => Ok((None, local.clone() as Arc<dyn SandboxHost>)),
                None => Err(HostError::NoRunner),
            },
        }
    }

    /// Host for an existing session. A dead runner yields `NoRunner`; the
    /// caller decides whether to reassign (resume) or fail (message send).
    pub async fn host_for(
        &self,
        runner_id: Option<&str>,
    ) -> Result<Arc<dyn SandboxHost>, HostError> {
        match runner_id {
            None => match &self.local {
                Some(local) => Ok(local.clone() as Arc<dyn SandboxHost>),
                None => Err(HostError::NoRunner),
            },
            Some(id) => {
                let runner = self
                    .registry
                    .get_live(id)
                    .await
                    .map_err(|e| HostError::Internal(e.to_string()))?
                    .ok_or(HostError::NoRunner)?;
                Ok(self.remote(runner.base_url()))
            }
        }
    }
}

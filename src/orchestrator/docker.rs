// Keystone Orchestrator — Container Control
// Docker-level stop/start for the GPU handoff pair. Container stop is used
// instead of in-process sleep because the generation runtime's allocator
// may not fully return weights to the device; a stopped container always
// does.

use crate::atoms::error::EngineResult;
use async_trait::async_trait;
use bollard::query_parameters::{StartContainerOptions, StopContainerOptionsBuilder};
use bollard::Docker;
use log::info;

#[async_trait]
pub trait ContainerControl: Send + Sync {
    async fn stop(&self, name: &str) -> EngineResult<()>;
    async fn start(&self, name: &str) -> EngineResult<()>;
    async fn is_running(&self, name: &str) -> EngineResult<bool>;
}

pub struct BollardControl {
    docker: Docker,
}

impl BollardControl {
    pub fn connect() -> EngineResult<Self> {
        Ok(BollardControl { docker: Docker::connect_with_local_defaults()? })
    }
}

#[async_trait]
impl ContainerControl for BollardControl {
    async fn stop(&self, name: &str) -> EngineResult<()> {
        info!("[orchestrator] docker stop {}", name);
        self.docker
            .stop_container(name, Some(StopContainerOptionsBuilder::default().t(30).build()))
            .await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> EngineResult<()> {
        info!("[orchestrator] docker start {}", name);
        self.docker
            .start_container(name, None::<StartContainerOptions>)
            .await?;
        Ok(())
    }

    async fn is_running(&self, name: &str) -> EngineResult<bool> {
        let inspect = self.docker.inspect_container(name, None).await?;
        Ok(inspect.state.and_then(|s| s.running).unwrap_or(false))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records every stop/start and reports a scripted running state.
    #[derive(Default)]
    pub struct RecordingControl {
        pub log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ContainerControl for RecordingControl {
        async fn stop(&self, name: &str) -> EngineResult<()> {
            self.log.lock().push(format!("stop {name}"));
            Ok(())
        }

        async fn start(&self, name: &str) -> EngineResult<()> {
            self.log.lock().push(format!("start {name}"));
            Ok(())
        }

        async fn is_running(&self, name: &str) -> EngineResult<bool> {
            let log = self.log.lock();
            // Running if the most recent action for this container was a start
            Ok(log.iter().rev().find_map(|entry| {
                if entry == &format!("start {name}") {
                    Some(true)
                } else if entry == &format!("stop {name}") {
                    Some(false)
                } else {
                    None
                }
            }).unwrap_or(false))
        }
    }
}

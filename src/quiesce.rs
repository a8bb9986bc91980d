//! Quiescing application containers around snapshot creation.
//!
//! Останавливаем в обратном порядке объявления (зависимые первыми),
//! запускаем в прямом.

use std::sync::Arc;

use log::debug;

use crate::provider::runner::{CommandRunner, SystemRunner};
use crate::provider::ProviderError;

pub trait ContainerRuntime: Send + Sync {
    fn stop(&self, names: &[String]) -> Result<(), ProviderError>;
    fn start(&self, names: &[String]) -> Result<(), ProviderError>;
}

pub struct DockerRuntime {
    runner: Arc<dyn CommandRunner>,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new(Arc::new(SystemRunner))
    }
}

impl DockerRuntime {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn docker(&self, verb: &str, names: impl Iterator<Item = String>) -> Result<(), ProviderError> {
        let mut args: Vec<String> = vec![verb.to_string()];
        args.extend(names);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        debug!("docker {}", refs.join(" "));
        self.runner.run_checked("docker", &refs).map(|_| ())
    }
}

impl ContainerRuntime for DockerRuntime {
    fn stop(&self, names: &[String]) -> Result<(), ProviderError> {
        if names.is_empty() {
            return Ok(());
        }
        self.docker("stop", names.iter().rev().cloned())
    }

    fn start(&self, names: &[String]) -> Result<(), ProviderError> {
        if names.is_empty() {
            return Ok(());
        }
        self.docker("start", names.iter().cloned())
    }
}

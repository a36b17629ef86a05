use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::model::{ConfigError, InstanceConfig};
use crate::supervisor::{Instance, Services, SupervisorError};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("server {0} already exists")]
    AlreadyExists(String),
    #[error("server {0} does not exist")]
    NotFound(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Name -> instance map shared by the boot loader and the API layer.
#[derive(Clone)]
pub struct InstanceRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<Instance>>>>,
    services: Arc<Services>,
}

impl InstanceRegistry {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            services,
        }
    }

    /// Registers every valid record found in the config store.
    pub async fn boot(services: Arc<Services>) -> anyhow::Result<Self> {
        let configs = services.store.load_all().await?;
        let registry = Self::new(services);
        {
            let mut map = registry.inner.write().await;
            for cfg in configs {
                tracing::info!(instance = %cfg.name, plugin = %cfg.plugin, "loaded server");
                let inst = Instance::new(cfg, registry.services.clone());
                map.insert(inst.name().to_string(), inst);
            }
            tracing::info!(count = map.len(), "server registry ready");
        }
        Ok(registry)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Instance>> {
        self.inner.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registers a new instance, persists its record and provisions its
    /// account. The name is released again if provisioning fails.
    pub async fn create(&self, config: InstanceConfig, password: &str) -> Result<Arc<Instance>, RegistryError> {
        config.validate()?;
        let name = config.name.clone();
        let inst = {
            let mut map = self.inner.write().await;
            if map.contains_key(&name) {
                return Err(RegistryError::AlreadyExists(name));
            }
            let inst = Instance::new(config, self.services.clone());
            map.insert(name.clone(), inst.clone());
            inst
        };

        if let Err(e) = inst.provision(password).await {
            tracing::error!(instance = %name, error = %e, "provisioning failed, unregistering server");
            self.inner.write().await.remove(&name);
            return Err(e.into());
        }
        tracing::info!(instance = %name, "server created");
        Ok(inst)
    }

    /// Tears the instance down and forgets it. A failed teardown keeps it
    /// registered.
    pub async fn remove(&self, name: &str) -> Result<(), RegistryError> {
        let inst = self
            .get(name)
            .await
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        inst.destroy().await?;
        self.inner.write().await.remove(name);
        tracing::info!(instance = %name, "server deleted");
        Ok(())
    }

    /// Kills every instance; used on daemon shutdown.
    pub async fn kill_all(&self) {
        let all: Vec<Arc<Instance>> = self.inner.read().await.values().cloned().collect();
        futures_util::future::join_all(all.iter().map(|inst| async move {
            if inst.status().await.has_process() {
                tracing::info!(instance = %inst.name(), "killing server for shutdown");
                inst.kill().await;
            }
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use hearth_process::PowerState;

    use super::*;
    use crate::model::sample_config;
    use crate::supervisor::testing::{Fakes, Options};

    fn fakes() -> (tempfile::TempDir, Fakes) {
        let dir = tempfile::tempdir().unwrap();
        let fakes = Fakes::new(dir.path(), Options::default());
        (dir, fakes)
    }

    #[tokio::test]
    async fn boot_loads_stored_records() {
        let (_dir, f) = fakes();
        f.services.store.save(&sample_config("b")).await.unwrap();
        f.services.store.save(&sample_config("a")).await.unwrap();

        let reg = InstanceRegistry::boot(f.services.clone()).await.unwrap();
        assert_eq!(reg.names().await, vec!["a", "b"]);
        assert_eq!(reg.get("a").await.unwrap().status().await, PowerState::Off);
        assert!(reg.get("c").await.is_none());
    }

    #[tokio::test]
    async fn create_provisions_and_rejects_duplicates() {
        let (_dir, f) = fakes();
        let reg = InstanceRegistry::new(f.services.clone());

        reg.create(sample_config("mc1"), "hunter2").await.unwrap();
        assert_eq!(f.host.calls(), vec!["create_user mc1 hunter2"]);
        assert_eq!(f.services.store.load("mc1").await.unwrap(), sample_config("mc1"));

        let err = reg.create(sample_config("mc1"), "x").await.unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists(_)));
        assert_eq!(f.host.calls().len(), 1);
    }

    #[tokio::test]
    async fn create_rejects_invalid_config() {
        let (_dir, f) = fakes();
        let reg = InstanceRegistry::new(f.services.clone());
        let mut cfg = sample_config("mc1");
        cfg.gameport = 0;
        let err = reg.create(cfg, "pw").await.unwrap_err();
        assert!(matches!(err, RegistryError::Config(ConfigError::ZeroPort)));
        assert!(reg.names().await.is_empty());
    }

    #[tokio::test]
    async fn remove_destroys_and_deregisters() {
        let (_dir, f) = fakes();
        let reg = InstanceRegistry::new(f.services.clone());
        reg.create(sample_config("mc1"), "pw").await.unwrap();

        reg.remove("mc1").await.unwrap();
        assert!(reg.get("mc1").await.is_none());
        assert!(f.services.store.load("mc1").await.is_err());
        assert!(f.host.calls().contains(&"remove_user mc1".to_string()));
        assert_eq!(f.rt.count(&f.rt.deletes), 1);

        assert!(matches!(reg.remove("mc1").await, Err(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn kill_all_stops_running_servers_only() {
        let (_dir, f) = fakes();
        let reg = InstanceRegistry::new(f.services.clone());
        let a = reg.create(sample_config("a"), "pw").await.unwrap();
        reg.create(sample_config("b"), "pw").await.unwrap();

        a.preflight().await.unwrap();
        assert_eq!(a.status().await, PowerState::Starting);

        reg.kill_all().await;
        assert_eq!(a.status().await, PowerState::Off);
        assert_eq!(f.rt.count(&f.rt.kills), 1);
    }
}

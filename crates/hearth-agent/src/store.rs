use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::io::AsyncWriteExt;

use crate::model::{InstanceConfig, normalize_name};

/// One JSON record per instance under a single directory.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, name: &str) -> anyhow::Result<PathBuf> {
        let name = normalize_name(name, "name")?;
        Ok(self.dir.join(format!("{name}.json")))
    }

    /// Reads every record; malformed ones are skipped with a warning.
    pub async fn load_all(&self) -> anyhow::Result<Vec<InstanceConfig>> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create data dir {}", self.dir.display()))?;

        let mut out = Vec::new();
        let mut rd = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("read data dir {}", self.dir.display()))?;
        while let Some(de) = rd.next_entry().await? {
            let path = de.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable instance record");
                    continue;
                }
            };
            let cfg = match serde_json::from_slice::<InstanceConfig>(&raw) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed instance record");
                    continue;
                }
            };
            if let Err(e) = cfg.validate() {
                tracing::warn!(path = %path.display(), error = %e, "skipping invalid instance record");
                continue;
            }
            out.push(cfg);
        }

        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub async fn load(&self, name: &str) -> anyhow::Result<InstanceConfig> {
        let path = self.record_path(name)?;
        let raw = tokio::fs::read(&path)
            .await
            .with_context(|| format!("read instance record {}", path.display()))?;
        serde_json::from_slice(&raw).with_context(|| format!("parse instance record {}", path.display()))
    }

    /// Atomic replace: write a temp file, then rename over the record.
    pub async fn save(&self, cfg: &InstanceConfig) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create data dir {}", self.dir.display()))?;

        let path = self.record_path(&cfg.name)?;
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(cfg).context("serialize instance record")?;

        let mut f = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(&data)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        f.flush()
            .await
            .with_context(|| format!("flush {}", tmp.display()))?;

        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("persist instance record {}", path.display()))?;
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> anyhow::Result<()> {
        let path = self.record_path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove instance record {}", path.display())),
        }
    }
}

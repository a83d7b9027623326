use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Persisted per-connector settings.  Connectors are enabled unless listed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectorOptions {
    #[serde(default)]
    pub disabled_connectors: BTreeSet<String>,
}

pub struct OptionsManager {
    options: Arc<RwLock<ConnectorOptions>>,
    options_file: PathBuf,
}

impl OptionsManager {
    pub fn new(options_file: PathBuf) -> Self {
        let options = Self::load_persistent(&options_file);
        Self {
            options: Arc::new(RwLock::new(options)),
            options_file,
        }
    }

    pub async fn get_options(&self) -> ConnectorOptions {
        self.options.read().await.clone()
    }

    pub async fn is_connector_enabled(&self, connector_id: &str) -> bool {
        !self
            .options
            .read()
            .await
            .disabled_connectors
            .contains(connector_id)
    }

    pub async fn set_connector_enabled(
        &self,
        connector_id: &str,
        enabled: bool,
    ) -> anyhow::Result<()> {
        {
            let mut options = self.options.write().await;
            let changed = if enabled {
                options.disabled_connectors.remove(connector_id)
            } else {
                options.disabled_connectors.insert(connector_id.to_string())
            };
            if !changed {
                return Ok(());
            }
        }
        self.save().await
    }

    async fn save(&self) -> anyhow::Result<()> {
        let options = self.options.read().await;

        if let Some(parent) = self.options_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&*options)?;
        tokio::fs::write(&self.options_file, json).await?;
        Ok(())
    }

    fn load_persistent(options_file: &Path) -> ConnectorOptions {
        let content = match std::fs::read_to_string(options_file) {
            Ok(content) => content,
            Err(_) => return ConnectorOptions::default(),
        };
        match serde_json::from_str::<ConnectorOptions>(&content) {
            Ok(options) => options,
            Err(e) => {
                warn!("Ignoring unreadable options file {:?}: {}", options_file, e);
                ConnectorOptions::default()
            }
        }
    }
}

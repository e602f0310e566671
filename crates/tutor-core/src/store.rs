//! Preference store ports and adapters.
//!
//! The voice loop only ever calls [`ConfigStore::load`] (once per session).
//! `save` exists for the settings screen. Learner progress goes through
//! [`ProgressStore`] at the end of each session.

use crate::config::VoiceLoopConfig;
use crate::error::{CoreError, CoreResult};
use crate::progress::LearnerProgress;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Load and save the voice loop settings.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> CoreResult<VoiceLoopConfig>;
    fn save(&self, config: &VoiceLoopConfig) -> CoreResult<()>;
}

/// Load and save learner progress.
pub trait ProgressStore: Send + Sync {
    fn load_progress(&self) -> CoreResult<LearnerProgress>;
    fn save_progress(&self, progress: &LearnerProgress) -> CoreResult<()>;
}

/// In-memory store for tests and demos.
#[derive(Debug, Default)]
pub struct MemoryStore {
    config: Mutex<VoiceLoopConfig>,
    progress: Mutex<LearnerProgress>,
}

impl MemoryStore {
    pub fn new(config: VoiceLoopConfig) -> Self {
        Self {
            config: Mutex::new(config),
            progress: Mutex::new(LearnerProgress::default()),
        }
    }

    pub fn with_progress(self, progress: LearnerProgress) -> Self {
        *self.progress.lock().unwrap_or_else(|e| e.into_inner()) = progress;
        self
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> CoreResult<VoiceLoopConfig> {
        Ok(self.config.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, config: &VoiceLoopConfig) -> CoreResult<()> {
        config.validate()?;
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = config.clone();
        Ok(())
    }
}

impl ProgressStore for MemoryStore {
    fn load_progress(&self) -> CoreResult<LearnerProgress> {
        Ok(self.progress.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save_progress(&self, progress: &LearnerProgress) -> CoreResult<()> {
        *self.progress.lock().unwrap_or_else(|e| e.into_inner()) = progress.clone();
        Ok(())
    }
}

const PREFS_TREE: &str = "preferences";
const CONFIG_KEY: &str = "voice_loop_config";
const PROGRESS_KEY: &str = "learner_progress";

/// Key-value preference store on a Sled tree. Values are JSON.
pub struct SledStore {
    tree: sled::Tree,
}

impl SledStore {
    /// Opens or creates the preference DB at the given path.
    pub fn open_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(&db)
    }

    pub fn from_db(db: &sled::Db) -> CoreResult<Self> {
        let tree = db.open_tree(PREFS_TREE)?;
        Ok(Self { tree })
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> CoreResult<Option<T>> {
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: serde::Serialize>(&self, key: &str, value: &T) -> CoreResult<()> {
        let bytes = serde_json::to_vec(value)?;
        let prev = self.tree.insert(key.as_bytes(), bytes)?;
        self.tree.flush()?;
        debug!(
            key = key,
            action = if prev.is_some() { "UPDATE" } else { "INSERT" },
            "preference written"
        );
        Ok(())
    }
}

impl ConfigStore for SledStore {
    fn load(&self) -> CoreResult<VoiceLoopConfig> {
        let config: VoiceLoopConfig = self.get_json(CONFIG_KEY)?.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    fn save(&self, config: &VoiceLoopConfig) -> CoreResult<()> {
        config.validate()?;
        self.put_json(CONFIG_KEY, config)
    }
}

impl ProgressStore for SledStore {
    fn load_progress(&self) -> CoreResult<LearnerProgress> {
        Ok(self.get_json(PROGRESS_KEY)?.unwrap_or_default())
    }

    fn save_progress(&self, progress: &LearnerProgress) -> CoreResult<()> {
        self.put_json(PROGRESS_KEY, progress)
    }
}

/// Settings in a TOML file, with `TUTOR_VOICE__*` environment overrides on load.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> CoreResult<VoiceLoopConfig> {
        VoiceLoopConfig::load_layered(Some(&self.path))
    }

    fn save(&self, config: &VoiceLoopConfig) -> CoreResult<()> {
        config.validate()?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, config.to_toml()?)?;
        info!("Voice settings saved to {}", self.path.display());
        Ok(())
    }
}

/// Reject a store value that fails validation instead of silently replacing it.
pub fn load_validated(store: &dyn ConfigStore) -> CoreResult<VoiceLoopConfig> {
    let config = store.load()?;
    config
        .validate()
        .map_err(|e| CoreError::InvalidConfig(format!("stored settings rejected: {}", e)))?;
    Ok(config)
}

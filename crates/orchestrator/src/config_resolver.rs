use std::path::{Path, PathBuf};

use serde::Deserialize;
use notes_sessions::RuntimeMode;

const CONFIG_RELATIVE_PATH: &str = "agent/config.json";

#[derive(Debug, Deserialize)]
struct OnDisk {
    #[serde(default)]
    runtime_mode: Option<RuntimeModeField>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
enum RuntimeModeField {
    DirectKey,
    Gateway,
}

impl From<RuntimeModeField> for RuntimeMode {
    fn from(f: RuntimeModeField) -> Self {
        match f {
            RuntimeModeField::DirectKey => RuntimeMode::DirectKey,
            RuntimeModeField::Gateway => RuntimeMode::Gateway,
        }
    }
}

/// Resolves per-person runtime mode from `<person>/agent/config.json` (C10,
/// §6.3). A missing file is not an error — it resolves to `default_mode`.
pub struct ConfigResolver {
    vault_root: PathBuf,
    default_mode: RuntimeMode,
}

impl ConfigResolver {
    pub fn new(vault_root: impl Into<PathBuf>, default_mode: RuntimeMode) -> Self {
        Self {
            vault_root: vault_root.into(),
            default_mode,
        }
    }

    pub fn resolve(&self, person: &str) -> RuntimeMode {
        let path = self.config_path(person);
        self.read(&path).unwrap_or(self.default_mode)
    }

    fn config_path(&self, person: &str) -> PathBuf {
        self.vault_root.join(person).join(CONFIG_RELATIVE_PATH)
    }

    fn read(&self, path: &Path) -> Option<RuntimeMode> {
        let content = std::fs::read_to_string(path).ok()?;
        let parsed: OnDisk = serde_json::from_str(&content).ok()?;
        parsed.runtime_mode.map(RuntimeMode::from)
    }
}

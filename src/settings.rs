use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resolver::AssetKind;

/// Name of this extension's entry in the host's persistent settings storage.
pub const SETTINGS_SLOT: &str = "animated_avatars";

/// Session settings, loaded once at startup. Missing keys are filled from
/// defaults and the merged object is written back; unknown keys the host may
/// have stored alongside are ignored rather than rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Companion preference order; first hit wins.
    #[serde(default = "default_order")]
    pub order: Vec<AssetKind>,
    /// Probe with HEAD to avoid downloading full assets.
    #[serde(default = "default_use_head_probe")]
    pub use_head_probe: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            order: default_order(),
            use_head_probe: default_use_head_probe(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_order() -> Vec<AssetKind> {
    vec![AssetKind::Webp, AssetKind::Webm, AssetKind::Mp4]
}

fn default_use_head_probe() -> bool {
    true
}

/// Host-managed persistent settings storage. The host owns durability and
/// debouncing; this crate only reads one named slot at startup and writes it
/// back when defaults had to be merged in.
pub trait SettingsStore {
    fn load(&self, slot: &str) -> Option<Value>;
    fn save(&self, slot: &str, value: &Value);
}

/// Load [`Settings`] from the store, merging defaults for any missing key.
/// A slot that is absent or unreadable falls back to pure defaults.
pub fn load_settings(store: &dyn SettingsStore) -> Settings {
    match store.load(SETTINGS_SLOT) {
        None => {
            let settings = Settings::default();
            persist(store, &settings);
            settings
        }
        Some(stored) => {
            let settings: Settings = match serde_json::from_value(stored.clone()) {
                Ok(settings) => settings,
                Err(error) => {
                    eprintln!("[WARN] stored avatar settings are malformed, using defaults: {error}");
                    Settings::default()
                }
            };
            // Write back only when merging actually changed the stored shape.
            if serde_json::to_value(&settings).ok().as_ref() != Some(&stored) {
                persist(store, &settings);
            }
            settings
        }
    }
}

fn persist(store: &dyn SettingsStore, settings: &Settings) {
    match serde_json::to_value(settings) {
        Ok(value) => store.save(SETTINGS_SLOT, &value),
        Err(error) => eprintln!("[WARN] failed to serialize avatar settings: {error}"),
    }
}

/// Parse a comma-separated preference order, e.g. `webp,webm,mp4`.
pub fn parse_order(raw: &str) -> Result<Vec<AssetKind>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            AssetKind::parse(part)
                .with_context(|| format!("unknown asset kind '{part}' (expected webp, webm, mp4)"))
        })
        .collect()
}

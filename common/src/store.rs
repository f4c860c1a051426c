use log::{debug, warn};
use serde_json::{Map, Value};

use crate::{
    channel::ChannelRegistry,
    config::ModuleConfig,
    error::StoreError,
    ports::FileSystem,
};

pub const CONFIG_PATH: &str = "/config.json";
pub const SETTINGS_PATH: &str = "/settings.json";

/// Every file the node persists; a format removes all of them.
pub const PERSISTED_PATHS: [&str; 2] = [CONFIG_PATH, SETTINGS_PATH];

/// JSON documents on the node's filesystem.
///
/// Channel settings are one flat object keyed `<id>_name`, `<id>_timer`
/// (milliseconds) and `<id>_enabled`.
pub struct SettingsStore<F: FileSystem> {
    fs: F,
}

impl<F: FileSystem> SettingsStore<F> {
    pub fn new(fs: F) -> Self {
        Self { fs }
    }

    pub fn into_inner(self) -> F {
        self.fs
    }

    pub fn load_config(&mut self) -> Result<Option<ModuleConfig>, StoreError> {
        let Some(raw) = self.fs.read(CONFIG_PATH)? else {
            debug!("no {CONFIG_PATH} present");
            return Ok(None);
        };
        let mut config: ModuleConfig = serde_json::from_slice(&raw)?;
        config.sanitize();
        Ok(Some(config))
    }

    pub fn save_config(&mut self, config: &ModuleConfig) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(config)?;
        self.fs.write(CONFIG_PATH, &payload)?;
        Ok(())
    }

    /// Applies stored name, timer and enabled flag to every registered
    /// channel that has entries. Returns whether a settings file existed.
    pub fn load_channel_settings(
        &mut self,
        registry: &mut ChannelRegistry,
    ) -> Result<bool, StoreError> {
        let Some(raw) = self.fs.read(SETTINGS_PATH)? else {
            return Ok(false);
        };
        let document: Map<String, Value> = serde_json::from_slice(&raw)?;

        for channel in registry.iter_mut() {
            let id = channel.id().to_string();
            match document.get(&format!("{id}_name")) {
                Some(Value::String(name)) if !name.is_empty() => {
                    channel.rename(name);
                }
                Some(other) => warn!("ignoring stored name for `{id}`: {other}"),
                None => {}
            }
            match document.get(&format!("{id}_timer")).map(Value::as_u64) {
                Some(Some(timer_ms)) => {
                    channel.set_timer(timer_ms);
                }
                Some(None) => warn!("ignoring non-numeric stored timer for `{id}`"),
                None => {}
            }
            match document.get(&format!("{id}_enabled")).map(Value::as_bool) {
                Some(Some(enabled)) => {
                    channel.set_enabled(enabled);
                }
                Some(None) => warn!("ignoring non-boolean stored enabled flag for `{id}`"),
                None => {}
            }
        }
        Ok(true)
    }

    pub fn save_channel_settings(&mut self, registry: &ChannelRegistry) -> Result<(), StoreError> {
        let mut document = Map::new();
        for channel in registry.iter() {
            let id = channel.id();
            document.insert(format!("{id}_name"), Value::from(channel.name()));
            document.insert(format!("{id}_timer"), Value::from(channel.timer_ms()));
            document.insert(format!("{id}_enabled"), Value::from(channel.is_enabled()));
        }
        let payload = serde_json::to_vec(&document)?;
        self.fs.write(SETTINGS_PATH, &payload)?;
        Ok(())
    }

    pub fn format(&mut self) -> Result<(), StoreError> {
        self.fs.format()?;
        Ok(())
    }
}

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all)]

//! Session ownership: holds the embedded engine, applies and re-applies the
//! recognized settings surface, and maintains the reference-counted alert
//! mask. Also home of [`sim`], the in-process reference engine used by the
//! rest of the workspace.

pub mod settings;
pub mod sim;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use peervod_config::Config;
use peervod_core::{
    AddTorrentParams, AlertMask, Error, InfoHash, Result, SessionBackend, SettingValue,
    TorrentHandle,
};
use serde_json::Value;
use tracing::{debug, error, info};

/// Owns the engine and its settings.
pub struct SessionService {
    backend: Arc<dyn SessionBackend>,
    state: Mutex<ServiceState>,
}

struct ServiceState {
    /// Settings as last applied to the engine.
    applied: BTreeMap<String, SettingValue>,
    /// Alert-mask value requested by config (`session_alert_mask`).
    config_mask: u32,
    /// Mask every core service needs unconditionally.
    required_mask: u32,
    /// Live refcounted contributions, one counter per bit.
    mask_refs: [usize; 32],
}

impl ServiceState {
    fn live_mask(&self) -> u32 {
        let mut mask = 0_u32;
        for (bit, count) in self.mask_refs.iter().enumerate() {
            if *count > 0 {
                mask |= 1 << bit;
            }
        }
        mask
    }

    fn effective_mask(&self) -> i64 {
        i64::from(self.config_mask | self.required_mask | self.live_mask())
    }
}

impl SessionService {
    /// Construct the service, parse the config, and apply the full settings
    /// map to the engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the config names an unknown
    /// settings base, an unknown `session_*` key, or an ill-typed value.
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        required_mask: AlertMask,
        config: &Config,
    ) -> Result<Self> {
        let mut state = ServiceState {
            applied: BTreeMap::new(),
            config_mask: 0,
            required_mask: required_mask.0,
            mask_refs: [0; 32],
        };
        let settings = parse_config(config, &mut state)?;
        backend.apply_settings(&settings)?;
        state.applied = settings;
        info!(
            settings = state.applied.len(),
            "session settings applied"
        );
        Ok(Self {
            backend,
            state: Mutex::new(state),
        })
    }

    /// Re-parse the config and apply only the keys whose values changed.
    ///
    /// Validation happens before anything is applied, so a rejected config
    /// leaves the engine untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] on any rejected key or value.
    pub fn set_config(&self, config: &Config) -> Result<()> {
        let mut state = self.lock();
        let settings = parse_config(config, &mut state)?;
        let delta: BTreeMap<String, SettingValue> = settings
            .iter()
            .filter(|(key, value)| state.applied.get(*key) != Some(value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if delta.is_empty() {
            debug!("config change produced no settings delta");
            return Ok(());
        }
        // apply_settings never partially fails.
        self.backend.apply_settings(&delta)?;
        state.applied = settings;
        info!(changed = delta.len(), "session settings updated");
        Ok(())
    }

    /// Add a refcounted contribution to the live alert mask.
    ///
    /// # Errors
    ///
    /// Propagates engine settings errors.
    pub fn inc_alert_mask(&self, mask: AlertMask) -> Result<()> {
        self.adjust_mask(mask, 1)
    }

    /// Drop a contribution previously added with
    /// [`SessionService::inc_alert_mask`].
    ///
    /// # Errors
    ///
    /// Propagates engine settings errors.
    pub fn dec_alert_mask(&self, mask: AlertMask) -> Result<()> {
        self.adjust_mask(mask, -1)
    }

    fn adjust_mask(&self, mask: AlertMask, delta: isize) -> Result<()> {
        let mut state = self.lock();
        for bit in 0..32 {
            if mask.0 & (1 << bit) != 0 {
                let count = &mut state.mask_refs[bit];
                *count = count.saturating_add_signed(delta);
            }
        }
        let effective = state.effective_mask();
        if state.applied.get("alert_mask") == Some(&SettingValue::Int(effective)) {
            return Ok(());
        }
        let mut change = BTreeMap::new();
        change.insert("alert_mask".to_owned(), SettingValue::Int(effective));
        self.backend.apply_settings(&change)?;
        state
            .applied
            .insert("alert_mask".to_owned(), SettingValue::Int(effective));
        Ok(())
    }

    /// The engine behind this session.
    #[must_use]
    pub fn backend(&self) -> Arc<dyn SessionBackend> {
        Arc::clone(&self.backend)
    }

    /// Queue an asynchronous torrent add.
    ///
    /// # Errors
    ///
    /// Propagates engine errors.
    pub fn async_add_torrent(&self, params: AddTorrentParams) -> Result<()> {
        self.backend.async_add_torrent(params)
    }

    /// Queue an asynchronous torrent remove.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the handle is stale.
    pub fn remove_torrent(&self, handle: TorrentHandle, with_data: bool) -> Result<()> {
        self.backend.remove_torrent(handle, with_data)
    }

    /// Look up the live handle for an infohash.
    #[must_use]
    pub fn find_torrent(&self, info_hash: InfoHash) -> Option<TorrentHandle> {
        self.backend.find_torrent(info_hash)
    }

    /// Pause the whole session.
    pub fn pause(&self) {
        self.backend.pause_session();
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("session state mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

const SESSION_PREFIX: &str = "session_";

fn parse_config(config: &Config, state: &mut ServiceState) -> Result<BTreeMap<String, SettingValue>> {
    let base_name = config
        .get_str("session_settings_base")?
        .unwrap_or("default_settings");
    let mut parsed = settings::base_pack(base_name)
        .ok_or_else(|| Error::InvalidConfig(format!("no settings pack named \"{base_name}\"")))?;

    for (key, value) in config.iter() {
        let Some(name) = key.strip_prefix(SESSION_PREFIX) else {
            continue;
        };
        if name == "settings_base" {
            continue;
        }
        if settings::BLACKLIST.contains(&name) {
            debug!(setting = name, "ignoring blacklisted session setting");
            continue;
        }
        parsed.insert(name.to_owned(), convert_setting(name, value)?);
    }

    for (key, value) in settings::overrides() {
        parsed.insert(key, value);
    }

    // Specialized override: alert_mask is OR-ed with the runtime mask, not
    // replaced by it.
    let config_mask = match parsed.get("alert_mask") {
        Some(SettingValue::Int(value)) => u32::try_from(*value)
            .map_err(|_| Error::InvalidConfig(format!("alert_mask {value} out of range")))?,
        Some(other) => {
            return Err(Error::InvalidConfig(format!(
                "alert_mask is {other}, not an integer"
            )));
        }
        None => 0,
    };
    state.config_mask = config_mask;
    parsed.insert(
        "alert_mask".to_owned(),
        SettingValue::Int(state.effective_mask()),
    );

    Ok(parsed)
}

fn convert_setting(name: &str, value: &Value) -> Result<SettingValue> {
    let kind = settings::kind(name)
        .ok_or_else(|| Error::InvalidConfig(format!("unknown session setting \"{name}\"")))?;
    match (kind, value) {
        (settings::SettingKind::Bool, Value::Bool(flag)) => Ok(SettingValue::Bool(*flag)),
        (settings::SettingKind::Int, Value::Number(number)) => number
            .as_i64()
            .map(SettingValue::Int)
            .ok_or_else(|| Error::InvalidConfig(format!("\"{name}\": {number} is not an integer"))),
        (settings::SettingKind::Str, Value::String(text)) => Ok(SettingValue::Str(text.clone())),
        (_, other) => Err(Error::InvalidConfig(format!(
            "\"{name}\": {other} has the wrong type"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service_with(config: &Config) -> Result<(Arc<sim::SimSession>, SessionService)> {
        let backend = Arc::new(sim::SimSession::new());
        let service = SessionService::new(
            Arc::clone(&backend) as Arc<dyn SessionBackend>,
            AlertMask(peervod_core::category::STATUS),
            config,
        )?;
        Ok((backend, service))
    }

    #[test]
    fn applies_base_pack_with_overrides() -> Result<()> {
        let mut config = Config::new();
        config.set("session_connections_limit", json!(321));
        config.set("session_enable_dht", json!(true));
        let (backend, _service) = service_with(&config)?;

        let applied = backend.applied_settings();
        assert_eq!(
            applied.get("connections_limit"),
            Some(&SettingValue::Int(321))
        );
        // Overrides win over config.
        assert_eq!(applied.get("enable_dht"), Some(&SettingValue::Bool(false)));
        assert_eq!(
            applied.get("announce_ip"),
            Some(&SettingValue::Str(String::new()))
        );
        Ok(())
    }

    #[test]
    fn rejects_unknown_settings_base_and_keys() {
        let mut config = Config::new();
        config.set("session_settings_base", json!("turbo_mode"));
        assert!(matches!(
            service_with(&config),
            Err(Error::InvalidConfig(_))
        ));

        let mut config = Config::new();
        config.set("session_warp_factor", json!(9));
        assert!(matches!(
            service_with(&config),
            Err(Error::InvalidConfig(_))
        ));

        let mut config = Config::new();
        config.set("session_connections_limit", json!("many"));
        assert!(matches!(
            service_with(&config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn blacklisted_keys_are_dropped() -> Result<()> {
        let mut config = Config::new();
        config.set("session_user_agent", json!("sneaky/1.0"));
        let (backend, _service) = service_with(&config)?;
        assert_eq!(backend.applied_settings().get("user_agent"), None);
        Ok(())
    }

    #[test]
    fn alert_mask_combines_config_and_refcounts() -> Result<()> {
        let mut config = Config::new();
        config.set("session_alert_mask", json!(0b1000));
        let (backend, service) = service_with(&config)?;

        let base = 0b1000 | i64::from(peervod_core::category::STATUS);
        assert_eq!(
            backend.applied_settings().get("alert_mask"),
            Some(&SettingValue::Int(base))
        );

        service.inc_alert_mask(AlertMask(0b100_0000))?;
        assert_eq!(
            backend.applied_settings().get("alert_mask"),
            Some(&SettingValue::Int(base | 0b100_0000))
        );
        service.inc_alert_mask(AlertMask(0b100_0000))?;
        service.dec_alert_mask(AlertMask(0b100_0000))?;
        // Still one reference outstanding.
        assert_eq!(
            backend.applied_settings().get("alert_mask"),
            Some(&SettingValue::Int(base | 0b100_0000))
        );
        service.dec_alert_mask(AlertMask(0b100_0000))?;
        assert_eq!(
            backend.applied_settings().get("alert_mask"),
            Some(&SettingValue::Int(base))
        );
        Ok(())
    }

    #[test]
    fn set_config_applies_only_deltas() -> Result<()> {
        let config = Config::new();
        let (backend, service) = service_with(&config)?;
        backend.reset_settings_log();

        let mut updated = Config::new();
        updated.set("session_download_rate_limit", json!(1_000_000));
        service.set_config(&updated)?;
        let log = backend.settings_log();
        assert_eq!(log.len(), 1);
        assert_eq!(
            log[0].get("download_rate_limit"),
            Some(&SettingValue::Int(1_000_000))
        );
        assert_eq!(log[0].len(), 1, "unchanged keys must not be re-applied");

        // Re-applying the same config is a no-op.
        service.set_config(&updated)?;
        assert_eq!(backend.settings_log().len(), 1);
        Ok(())
    }
}

//! The engine's recognized settings surface: key names, value kinds, base
//! packs, and the keys this system refuses to pass through.

use std::collections::BTreeMap;

use peervod_core::SettingValue;

/// Keys silently dropped from user config and forced to engine defaults.
/// Identifying strings stay under our control.
pub const BLACKLIST: &[&str] = &["user_agent", "peer_fingerprint"];

/// Value kind of a recognized setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    /// Boolean setting.
    Bool,
    /// Integer setting.
    Int,
    /// String setting.
    Str,
}

const RECOGNIZED: &[(&str, SettingKind)] = &[
    ("active_downloads", SettingKind::Int),
    ("active_limit", SettingKind::Int),
    ("active_seeds", SettingKind::Int),
    ("aio_threads", SettingKind::Int),
    ("alert_mask", SettingKind::Int),
    ("alert_queue_size", SettingKind::Int),
    ("announce_ip", SettingKind::Str),
    ("announce_to_all_trackers", SettingKind::Bool),
    ("anonymous_mode", SettingKind::Bool),
    ("cache_size", SettingKind::Int),
    ("connections_limit", SettingKind::Int),
    ("download_rate_limit", SettingKind::Int),
    ("enable_dht", SettingKind::Bool),
    ("enable_incoming_utp", SettingKind::Bool),
    ("enable_lsd", SettingKind::Bool),
    ("enable_natpmp", SettingKind::Bool),
    ("enable_outgoing_utp", SettingKind::Bool),
    ("enable_upnp", SettingKind::Bool),
    ("handshake_client_version", SettingKind::Str),
    ("listen_interfaces", SettingKind::Str),
    ("max_out_request_queue", SettingKind::Int),
    ("peer_fingerprint", SettingKind::Str),
    ("prefer_rc4", SettingKind::Bool),
    ("request_timeout", SettingKind::Int),
    ("upload_rate_limit", SettingKind::Int),
    ("user_agent", SettingKind::Str),
];

/// The value kind of a recognized setting name, or `None` if unknown.
#[must_use]
pub fn kind(name: &str) -> Option<SettingKind> {
    RECOGNIZED
        .binary_search_by_key(&name, |(key, _)| key)
        .ok()
        .map(|index| RECOGNIZED[index].1)
}

/// Base settings pack by name (`default_settings` or
/// `high_performance_seed`), or `None` if the name is unknown.
#[must_use]
pub fn base_pack(name: &str) -> Option<BTreeMap<String, SettingValue>> {
    let default: &[(&str, SettingValue)] = &[
        ("active_downloads", SettingValue::Int(3)),
        ("active_limit", SettingValue::Int(15)),
        ("active_seeds", SettingValue::Int(5)),
        ("aio_threads", SettingValue::Int(10)),
        ("alert_mask", SettingValue::Int(0)),
        ("alert_queue_size", SettingValue::Int(2_000)),
        ("cache_size", SettingValue::Int(2_048)),
        ("connections_limit", SettingValue::Int(200)),
        ("download_rate_limit", SettingValue::Int(0)),
        ("upload_rate_limit", SettingValue::Int(0)),
        ("enable_dht", SettingValue::Bool(true)),
        ("enable_lsd", SettingValue::Bool(true)),
        ("enable_natpmp", SettingValue::Bool(true)),
        ("enable_upnp", SettingValue::Bool(true)),
        ("max_out_request_queue", SettingValue::Int(500)),
        ("request_timeout", SettingValue::Int(60)),
    ];
    let seedbox: &[(&str, SettingValue)] = &[
        ("active_seeds", SettingValue::Int(2_000)),
        ("active_limit", SettingValue::Int(2_000)),
        ("aio_threads", SettingValue::Int(16)),
        ("alert_queue_size", SettingValue::Int(10_000)),
        ("cache_size", SettingValue::Int(32_768)),
        ("connections_limit", SettingValue::Int(8_000)),
        ("max_out_request_queue", SettingValue::Int(1_500)),
    ];

    let mut pack: BTreeMap<String, SettingValue> = default
        .iter()
        .map(|(key, value)| ((*key).to_owned(), value.clone()))
        .collect();
    match name {
        "default_settings" => {}
        "high_performance_seed" => {
            for (key, value) in seedbox {
                pack.insert((*key).to_owned(), value.clone());
            }
        }
        _ => return None,
    }
    Some(pack)
}

/// Key/value pairs forced regardless of what the config asks for.
#[must_use]
pub fn overrides() -> BTreeMap<String, SettingValue> {
    let mut forced = BTreeMap::new();
    forced.insert("announce_ip".to_owned(), SettingValue::Str(String::new()));
    forced.insert(
        "handshake_client_version".to_owned(),
        SettingValue::Str(String::new()),
    );
    forced.insert("enable_lsd".to_owned(), SettingValue::Bool(false));
    forced.insert("enable_dht".to_owned(), SettingValue::Bool(false));
    forced.insert(
        "alert_queue_size".to_owned(),
        SettingValue::Int(i64::from(u32::MAX)),
    );
    forced
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognized_table_is_sorted_for_binary_search() {
        let mut names: Vec<_> = RECOGNIZED.iter().map(|(name, _)| *name).collect();
        names.sort_unstable();
        assert_eq!(
            names,
            RECOGNIZED.iter().map(|(name, _)| *name).collect::<Vec<_>>()
        );
    }

    #[test]
    fn kind_lookup() {
        assert_eq!(kind("enable_dht"), Some(SettingKind::Bool));
        assert_eq!(kind("alert_mask"), Some(SettingKind::Int));
        assert_eq!(kind("announce_ip"), Some(SettingKind::Str));
        assert_eq!(kind("no_such_setting"), None);
    }

    #[test]
    fn base_packs_exist_and_differ() {
        let default = base_pack("default_settings").unwrap();
        let seedbox = base_pack("high_performance_seed").unwrap();
        assert!(base_pack("turbo_mode").is_none());
        assert_ne!(
            default.get("connections_limit"),
            seedbox.get("connections_limit")
        );
        // Every pack key must be recognized.
        for name in default.keys().chain(seedbox.keys()) {
            assert!(kind(name).is_some(), "pack key {name} not recognized");
        }
    }

    #[test]
    fn overrides_pin_identity_and_discovery() {
        let forced = overrides();
        assert_eq!(
            forced.get("enable_dht"),
            Some(&SettingValue::Bool(false))
        );
        assert_eq!(
            forced.get("announce_ip"),
            Some(&SettingValue::Str(String::new()))
        );
    }
}

use config::{Config, ConfigError, Environment, File};
use mule_node::BundleLayerConfig;
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct MuledConfig {
    pub state_path: PathBuf,
    pub node_key_path: PathBuf,
    /// Hex secret; takes precedence over `node_key_path`.
    pub node_key: Option<String>,
    #[serde(with = "humantime_serde")]
    pub snapshot_interval: Duration,
    /// Hex node ids trusted as web-of-trust anchors.
    #[serde(deserialize_with = "deserialize_list")]
    pub genesis: Vec<String>,
    pub access_point: Option<String>,
    /// Initial battery level; mains-powered nodes leave this unset.
    pub battery_level: Option<u8>,
    #[serde(default)]
    pub layer: BundleLayerConfig,
}

fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ListVisitor;

    impl<'de> Visitor<'de> for ListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a sequence of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(split_list(value))
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut vec = Vec::new();
            while let Some(element) = seq.next_element()? {
                vec.push(element);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(ListVisitor)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl MuledConfig {
    /// Layers defaults, then an optional file, then `MULE_*` variables.
    ///
    /// Bundle layer settings nest under `layer`; from the environment use a
    /// double underscore, e.g. `MULE_LAYER__ROLE=bridge`.
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("state_path", "data/muled-state.cbor")?
            .set_default("node_key_path", "data/node_identity.key")?
            .set_default("node_key", None::<String>)?
            .set_default("snapshot_interval", "5m")?
            .set_default("genesis", Vec::<String>::new())?;

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("MULE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mule_node::NodeRole;
    use std::env;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env<F>(vars: &[(&str, &str)], test: F)
    where
        F: FnOnce(),
    {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut old = Vec::new();
        for (k, v) in vars {
            old.push((k.to_string(), env::var(k).ok()));
            env::set_var(k, v);
        }

        test();

        for (k, maybe_old) in old {
            match maybe_old {
                Some(val) => env::set_var(k, val),
                None => env::remove_var(k),
            }
        }
    }

    #[test]
    fn defaults_are_applied() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let cfg = MuledConfig::new(None).expect("failed to build config");

        assert_eq!(cfg.state_path, PathBuf::from("data/muled-state.cbor"));
        assert_eq!(cfg.node_key_path, PathBuf::from("data/node_identity.key"));
        assert_eq!(cfg.snapshot_interval, Duration::from_secs(300));
        assert!(cfg.genesis.is_empty());
        assert_eq!(cfg.layer, BundleLayerConfig::default());
        assert_eq!(cfg.layer.hop_limit_default, 20);
    }

    #[test]
    fn env_vars_override_defaults() {
        with_env(
            &[
                ("MULE_SNAPSHOT_INTERVAL", "30s"),
                ("MULE_BATTERY_LEVEL", "42"),
                ("MULE_LAYER__ROLE", "bridge"),
                ("MULE_LAYER__HOP_LIMIT_DEFAULT", "12"),
                ("MULE_LAYER__REAPER_PERIOD", "2m"),
            ],
            || {
                let cfg = MuledConfig::new(None).expect("failed to build config");
                assert_eq!(cfg.snapshot_interval, Duration::from_secs(30));
                assert_eq!(cfg.battery_level, Some(42));
                assert_eq!(cfg.layer.role, NodeRole::Bridge);
                assert_eq!(cfg.layer.hop_limit_default, 12);
                assert_eq!(cfg.layer.reaper_period, Duration::from_secs(120));
            },
        );
    }

    #[test]
    fn file_values_apply_and_env_wins() {
        use std::io::Write;

        let mut tmp = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(
            tmp,
            r#"
state_path = "/var/lib/muled/state.cbor"
genesis = ["aa", "bb"]

[layer]
role = "library"
storage_budget_bytes = 1048576

[layer.ttl]
knowledge_secs = 31536000
"#
        )
        .expect("write to temp file");

        with_env(&[("MULE_LAYER__STORAGE_BUDGET_BYTES", "2097152")], || {
            let cfg = MuledConfig::new(Some(PathBuf::from(tmp.path()))).expect("load config");
            assert_eq!(cfg.state_path, PathBuf::from("/var/lib/muled/state.cbor"));
            assert_eq!(cfg.genesis, vec!["aa".to_string(), "bb".to_string()]);
            assert_eq!(cfg.layer.role, NodeRole::Library);
            assert_eq!(cfg.layer.storage_budget_bytes, 2_097_152);
            assert_eq!(cfg.layer.ttl.knowledge_secs, 31_536_000);
        });
    }

    #[test]
    fn list_values_split_on_commas_and_semicolons() {
        assert_eq!(split_list("a, b;c,,"), vec!["a", "b", "c"]);
        assert!(split_list("  ").is_empty());
    }
}

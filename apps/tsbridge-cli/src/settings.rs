use anyhow::{anyhow, Context};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tsbridge_node::{ConnectionConfig, PublisherConfig, SubscriberConfig};
use tsbridge_transport::adapter::Qos;

/// Flat settings for both roles, layered defaults < file < `TSBRIDGE_*` env.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeSettings {
    pub broker: String,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub instance: String,
    pub qos: u8,
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub include_timestamp: bool,
    pub relative_timestamp: bool,
    #[serde(with = "humantime_serde")]
    pub send_timeout: Duration,
    pub retained: bool,
    pub use_physical_time: bool,
    #[serde(with = "humantime_serde")]
    pub offset: Duration,
    #[serde(with = "humantime_serde")]
    pub disconnect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl BridgeSettings {
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("broker", "ws://127.0.0.1:9001")?
            .set_default("topic", "tsbridge/default")?
            .set_default("client_id", None::<String>)?
            .set_default("instance", "")?
            .set_default("qos", 1)?
            .set_default("keep_alive", "20s")?
            .set_default("connect_timeout", "5s")?
            .set_default("include_timestamp", true)?
            .set_default("relative_timestamp", false)?
            .set_default("send_timeout", "10s")?
            .set_default("retained", false)?
            .set_default("use_physical_time", false)?
            .set_default("offset", "0s")?
            .set_default("disconnect_timeout", "2s")?
            .set_default("poll_interval", "10ms")?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                // Loaded into the process environment so the prefix source sees it.
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix("TSBRIDGE").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    fn connection(&self) -> anyhow::Result<ConnectionConfig> {
        let qos = Qos::from_u8(self.qos)
            .ok_or_else(|| anyhow!("qos must be 0, 1 or 2, got {}", self.qos))?;
        Ok(ConnectionConfig {
            broker: self.broker.clone(),
            topic: self.topic.clone(),
            client_id: self.client_id.clone(),
            instance: self.instance.clone(),
            qos,
            keep_alive: self.keep_alive,
            connect_timeout: self.connect_timeout,
        })
    }

    pub fn publisher_config(&self) -> anyhow::Result<PublisherConfig> {
        let cfg = PublisherConfig {
            connection: self.connection()?,
            include_timestamp: self.include_timestamp,
            relative_timestamp: self.relative_timestamp,
            send_timeout: self.send_timeout,
            retained: self.retained,
        };
        cfg.validate().context("invalid publisher settings")?;
        Ok(cfg)
    }

    pub fn subscriber_config(&self) -> anyhow::Result<SubscriberConfig> {
        let cfg = SubscriberConfig {
            connection: self.connection()?,
            use_physical_time: self.use_physical_time,
            relative_timestamp: self.relative_timestamp,
            offset: self.offset,
        };
        cfg.validate().context("invalid subscriber settings")?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Tests share the process environment.
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
        with_env(&[], || {
            let cfg = BridgeSettings::load(None).expect("failed to build config");
            assert_eq!(cfg.broker, "ws://127.0.0.1:9001");
            assert_eq!(cfg.topic, "tsbridge/default");
            assert_eq!(cfg.client_id, None);
            assert_eq!(cfg.qos, 1);
            assert!(cfg.include_timestamp);
            assert!(!cfg.use_physical_time);
            assert_eq!(cfg.send_timeout, Duration::from_secs(10));
            assert_eq!(cfg.poll_interval, Duration::from_millis(10));
            assert_eq!(cfg.offset, Duration::ZERO);
        });
    }

    #[test]
    fn env_vars_override_defaults() {
        with_env(
            &[
                ("TSBRIDGE_TOPIC", "plant/line-3"),
                ("TSBRIDGE_QOS", "0"),
                ("TSBRIDGE_INCLUDE_TIMESTAMP", "false"),
                ("TSBRIDGE_OFFSET", "250ms"),
            ],
            || {
                let cfg = BridgeSettings::load(None).expect("failed to build config");
                assert_eq!(cfg.topic, "plant/line-3");
                assert_eq!(cfg.qos, 0);
                assert!(!cfg.include_timestamp);
                assert_eq!(cfg.offset, Duration::from_millis(250));
            },
        );
    }

    #[test]
    fn file_overrides_defaults_and_env_overrides_file() {
        use std::io::Write;

        let mut tmp = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(
            tmp,
            r#"
topic = "file/topic"
client_id = "from-file"
send_timeout = "3s"
retained = true
"#
        )
        .expect("write to temp file");

        with_env(&[("TSBRIDGE_RETAINED", "false")], || {
            let cfg = BridgeSettings::load(Some(PathBuf::from(tmp.path()))).expect("load config");
            assert_eq!(cfg.topic, "file/topic");
            assert_eq!(cfg.client_id.as_deref(), Some("from-file"));
            assert_eq!(cfg.send_timeout, Duration::from_secs(3));
            assert!(!cfg.retained);
        });
    }

    #[test]
    fn role_configs_carry_settings() {
        with_env(&[], || {
            let mut cfg = BridgeSettings::load(None).expect("config");
            cfg.qos = 2;
            cfg.relative_timestamp = true;
            let publisher = cfg.publisher_config().expect("publisher");
            assert_eq!(publisher.connection.qos, Qos::ExactlyOnce);
            assert!(publisher.relative_timestamp);
            let subscriber = cfg.subscriber_config().expect("subscriber");
            assert!(subscriber.relative_timestamp);
            assert!(subscriber.client_id().starts_with("sub-"));
        });
    }

    #[test]
    fn invalid_settings_are_rejected() {
        with_env(&[], || {
            let mut cfg = BridgeSettings::load(None).expect("config");
            cfg.qos = 3;
            assert!(cfg.publisher_config().is_err());
            cfg.qos = 1;
            cfg.topic = "wild/+".to_string();
            assert!(cfg.subscriber_config().is_err());
        });
    }
}

use figment::{providers::Env, Figment};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Name of the node this sidecar runs on, from `AGOGOS_HOSTNAME`.
    /// Routing decisions compare application placement against this name.
    pub hostname: String,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config: Config = Figment::from(Env::prefixed("AGOGOS_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.hostname.is_empty() {
            anyhow::bail!("AGOGOS_HOSTNAME not set. Exiting");
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_read_from_environment() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("AGOGOS_HOSTNAME", "n1");
            let config = Config::load().expect("config should load");
            assert_eq!(config.hostname, "n1");
            Ok(())
        });
    }

    #[test]
    fn missing_hostname_is_fatal() {
        figment::Jail::expect_with(|_jail| {
            assert!(Config::load().is_err());
            Ok(())
        });
    }

    #[test]
    fn empty_hostname_is_fatal() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("AGOGOS_HOSTNAME", "");
            assert!(Config::load().is_err());
            Ok(())
        });
    }
}

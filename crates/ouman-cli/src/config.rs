//! CLI configuration

use anyhow::Result;
use serde::Deserialize;

use ouman_identity::{CredentialSettings, EngineSettings, LdapStoreConfig};

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub directory: LdapStoreConfig,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub credentials: CredentialSettings,
}

#[derive(Debug, Default, Deserialize)]
pub struct EngineSection {
    #[serde(default)]
    pub compensate_partial_create: bool,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .set_default("directory.url", "ldap://localhost:389")?
            .set_default("directory.start_tls", false)?
            .set_default("engine.compensate_partial_create", false)?
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            // OUMAN__DIRECTORY__BIND_PASSWORD and friends
            .add_source(
                config::Environment::with_prefix("OUMAN")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Engine settings rooted at the directory's base DN
    pub fn engine_settings(&self) -> EngineSettings {
        let mut settings = EngineSettings::new(self.directory.base_dn.clone());
        settings.compensate_partial_create = self.engine.compensate_partial_create;
        settings
    }
}

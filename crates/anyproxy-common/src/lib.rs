use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged global configuration used by the running process.
///
/// Merge order (after DB connection): CLI > DB defaults, then persist back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub bind_host: String,
    pub bind_port: u16,
    /// Credential clients must present on the proxy endpoints. Empty disables
    /// the check.
    pub local_credential: String,
    /// SQLite file backing the route store and usage log.
    pub database_path: String,
    pub redirect_enabled: bool,
    /// Synthetic model name that resolves to `redirect_target_model`.
    pub redirect_keyword: String,
    pub redirect_target_model: String,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub bind_host: Option<String>,
    pub bind_port: Option<u16>,
    pub local_credential: Option<String>,
    pub database_path: Option<String>,
    pub redirect_enabled: Option<bool>,
    pub redirect_keyword: Option<String>,
    pub redirect_target_model: Option<String>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.bind_host.is_some() {
            self.bind_host = other.bind_host;
        }
        if other.bind_port.is_some() {
            self.bind_port = other.bind_port;
        }
        if other.local_credential.is_some() {
            self.local_credential = other.local_credential;
        }
        if other.database_path.is_some() {
            self.database_path = other.database_path;
        }
        if other.redirect_enabled.is_some() {
            self.redirect_enabled = other.redirect_enabled;
        }
        if other.redirect_keyword.is_some() {
            self.redirect_keyword = other.redirect_keyword;
        }
        if other.redirect_target_model.is_some() {
            self.redirect_target_model = other.redirect_target_model;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            bind_host: self.bind_host.unwrap_or_else(|| "127.0.0.1".to_string()),
            bind_port: self.bind_port.unwrap_or(8788),
            local_credential: self.local_credential.unwrap_or_default(),
            database_path: self
                .database_path
                .ok_or(GlobalConfigError::MissingField("database_path"))?,
            redirect_enabled: self.redirect_enabled.unwrap_or(false),
            redirect_keyword: self
                .redirect_keyword
                .unwrap_or_else(|| "proxy_auto".to_string()),
            redirect_target_model: self.redirect_target_model.unwrap_or_default(),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            bind_host: Some(value.bind_host),
            bind_port: Some(value.bind_port),
            local_credential: Some(value.local_credential),
            database_path: Some(value.database_path),
            redirect_enabled: Some(value.redirect_enabled),
            redirect_keyword: Some(value.redirect_keyword),
            redirect_target_model: Some(value.redirect_target_model),
        }
    }
}

//! CloudStack connection configuration.
//!
//! The file format is shared with the CloudStack cloud controller manager
//! so both read the same credentials: INI with a `[Global]` section.

use ini::Ini;
use snafu::Snafu;

/// Connection settings for the CloudStack API.
#[derive(Clone, Debug)]
pub struct CloudConfig {
    pub api_url: String,
    pub api_key: String,
    pub secret_key: String,
    pub verify_ssl: bool,
    /// Default project scope for reads and lists; empty means unscoped.
    pub project_id: String,
}

/// Configuration file errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum ConfigError {
    #[snafu(display("could not parse CloudStack config {}: {}", path, source))]
    Unreadable { path: String, source: ini::Error },
    #[snafu(display("CloudStack config {} has no [Global] section", path))]
    NoGlobalSection { path: String },
    #[snafu(display("CloudStack config {} is missing key {}", path, key))]
    MissingKey { path: String, key: String },
}

impl CloudConfig {
    /// Read the configuration file at `path`.
    pub fn read(path: &str) -> Result<Self, ConfigError> {
        let file = Ini::load_from_file(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_string(),
            source,
        })?;
        let global = file
            .section(Some("Global"))
            .ok_or_else(|| ConfigError::NoGlobalSection {
                path: path.to_string(),
            })?;

        let required = |key: &str| {
            global
                .get(key)
                .map(str::to_string)
                .ok_or_else(|| ConfigError::MissingKey {
                    path: path.to_string(),
                    key: key.to_string(),
                })
        };

        let ssl_no_verify = global
            .get("ssl-no-verify")
            .map(|value| value == "true")
            .unwrap_or(false);

        Ok(Self {
            api_url: required("api-url")?,
            api_key: required("api-key")?,
            secret_key: required("secret-key")?,
            verify_ssl: !ssl_no_verify,
            project_id: global.get("project-id").unwrap_or_default().to_string(),
        })
    }
}

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One row of the declarative app registry.
///
/// The registry file is a flat TOML table: each top-level key is an app
/// name mapped to one of these entries. The name doubles as a path and
/// URL segment, so the directory conventions below hang off it.
#[derive(Debug, Deserialize, Clone)]
pub struct AppEntry {
    /// Port the app listens on. 0 or absent excludes the entry from both
    /// supervision and rendering.
    #[serde(default)]
    pub port: u16,

    /// Public base path (default: "/" + app name)
    pub base: Option<String>,

    /// Disabled entries are kept in the file but skipped everywhere
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Marks the app whose session cookie is re-anchored to the document
    /// root in the generated proxy config. At most one per registry.
    #[serde(default)]
    pub sso_issuer: bool,

    /// Display title used in generated comment banners (default: app name)
    pub title: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl AppEntry {
    /// Entries take part in supervision and rendering only when enabled
    /// with a usable port.
    pub fn is_active(&self) -> bool {
        self.enabled && self.port > 0
    }
}

/// A resolved (name, entry) pair with the base path already normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRow {
    pub name: String,
    pub port: u16,
    pub base: String,
    pub sso_issuer: bool,
    pub title: String,
}

/// The declarative app registry, held sorted by app name so that spec
/// discovery and rendered output are deterministic.
#[derive(Debug, Default, Clone)]
pub struct AppRegistry {
    apps: BTreeMap<String, AppEntry>,
}

impl AppRegistry {
    /// Load and validate a registry file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::RegistryMissing(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        registry.validate()?;
        Ok(registry)
    }

    /// Parse without validating. `render` re-validates on its own, so a
    /// registry built here is usable but not yet trusted.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        let apps: BTreeMap<String, AppEntry> = toml::from_str(text)?;
        Ok(Self { apps })
    }

    /// The single cross-cutting registry invariant: at most one app may
    /// have `sso_issuer = true`. Zero is fine (no SSO).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let issuers: Vec<String> = self
            .apps
            .iter()
            .filter(|(_, entry)| entry.sso_issuer)
            .map(|(name, _)| name.clone())
            .collect();
        if issuers.len() > 1 {
            return Err(ConfigError::MultipleSsoIssuers { apps: issuers });
        }
        Ok(())
    }

    /// Enabled entries with a usable port, in name order.
    pub fn active_rows(&self) -> Vec<AppRow> {
        self.apps
            .iter()
            .filter(|(_, entry)| entry.is_active())
            .map(|(name, entry)| AppRow {
                name: name.clone(),
                port: entry.port,
                base: normalize_base(entry.base.as_deref(), name),
                sso_issuer: entry.sso_issuer,
                title: entry.title.clone().unwrap_or_else(|| name.clone()),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }
}

/// Normalize a public base path to exactly one leading slash and zero
/// trailing slashes. Missing or empty input falls back to "/" + name; an
/// input of only slashes normalizes to "/".
pub fn normalize_base(raw: Option<&str>, name: &str) -> String {
    let raw = raw.map(str::trim).unwrap_or("");
    if raw.is_empty() {
        return format!("/{}", name);
    }
    let core = raw.trim_matches('/');
    if core.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", core)
    }
}

/// One environment block of the settings document: where projects live,
/// where the proxy config goes, and how the host is reached.
#[derive(Debug, Deserialize, Clone)]
pub struct EnvironmentRecord {
    /// Base directory holding `<name>_project/<name>_app/` app directories
    pub project_root: PathBuf,

    /// Directory containing the live proxy configuration file
    pub proxy_config_root: PathBuf,

    /// Hostnames emitted verbatim into the server_name directive
    #[serde(default)]
    pub public_hostnames: Vec<String>,

    /// TLS files; when absent the generator derives paths from the
    /// primary hostname
    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,

    /// Directory serving the top-level static portal page
    pub static_portal_root: PathBuf,

    /// Worker user emitted into the generated config when set
    pub process_owner_user: Option<String>,
}

impl EnvironmentRecord {
    /// Hostnames deduplicated preserving first-seen order, with a
    /// localhost fallback when none are configured.
    pub fn server_names(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for host in &self.public_hostnames {
            let host = host.trim();
            if host.is_empty() || out.iter().any(|seen| seen == host) {
                continue;
            }
            out.push(host.to_string());
        }
        if out.is_empty() {
            out.push("localhost".to_string());
        }
        out
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
struct EnvSelector {
    current: Option<String>,
}

/// The environment settings document: a `current` selector under `[env]`
/// plus a map of named environment records under `[locations.*]`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    env: EnvSelector,
    #[serde(default)]
    locations: BTreeMap<String, EnvironmentRecord>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::SettingsMissing(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Resolve the selected environment. Exact key match first, then a
    /// case-insensitive match; anything else is a fatal config error.
    pub fn select(&self) -> Result<(&str, &EnvironmentRecord), ConfigError> {
        let current = self
            .env
            .current
            .as_deref()
            .ok_or(ConfigError::NoEnvironmentSelected)?;

        if let Some((name, record)) = self.locations.get_key_value(current) {
            return Ok((name.as_str(), record));
        }
        let folded = current.to_lowercase();
        for (name, record) in &self.locations {
            if name.to_lowercase() == folded {
                return Ok((name.as_str(), record));
            }
        }
        Err(ConfigError::UnknownEnvironment {
            name: current.to_string(),
            known: self.locations.keys().cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
[bot]
port = 8502

[auth]
port = 8591
base = "/auth"
sso_issuer = true
title = "Auth portal"

[legacy]
port = 8100
enabled = false

[draft]
enabled = true
"#;

    const SETTINGS: &str = r#"
[env]
current = "home"

[locations.home]
project_root = "/srv/projects"
proxy_config_root = "/opt/homebrew/etc/nginx"
public_hostnames = ["home.local", "localhost", "home.local"]
static_portal_root = "/srv/projects/apps_portal"

[locations.office]
project_root = "/work/projects"
proxy_config_root = "/etc/nginx"
public_hostnames = []
static_portal_root = "/work/portal"
process_owner_user = "ops"
"#;

    #[test]
    fn parses_registry_with_defaults() {
        let registry = AppRegistry::from_toml_str(REGISTRY).unwrap();
        assert_eq!(registry.len(), 4);

        let rows = registry.active_rows();
        // "draft" has no port, "legacy" is disabled
        assert_eq!(rows.len(), 2);
        // sorted by name
        assert_eq!(rows[0].name, "auth");
        assert_eq!(rows[1].name, "bot");

        assert_eq!(rows[0].base, "/auth");
        assert_eq!(rows[0].title, "Auth portal");
        assert!(rows[0].sso_issuer);

        assert_eq!(rows[1].base, "/bot");
        assert_eq!(rows[1].title, "bot");
        assert!(!rows[1].sso_issuer);
    }

    #[test]
    fn single_sso_issuer_is_valid() {
        let registry = AppRegistry::from_toml_str(REGISTRY).unwrap();
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn two_sso_issuers_fail_validation() {
        let text = r#"
[a]
port = 8001
sso_issuer = true

[b]
port = 8002
sso_issuer = true
"#;
        let registry = AppRegistry::from_toml_str(text).unwrap();
        let err = registry.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("\"a\""), "message names the apps: {}", msg);
        assert!(msg.contains("\"b\""), "message names the apps: {}", msg);
    }

    #[test]
    fn base_path_normalization() {
        assert_eq!(normalize_base(None, "bot"), "/bot");
        assert_eq!(normalize_base(Some(""), "bot"), "/bot");
        assert_eq!(normalize_base(Some("  "), "bot"), "/bot");
        assert_eq!(normalize_base(Some("bot"), "bot"), "/bot");
        assert_eq!(normalize_base(Some("/bot"), "bot"), "/bot");
        assert_eq!(normalize_base(Some("/bot/"), "bot"), "/bot");
        assert_eq!(normalize_base(Some("bot/"), "bot"), "/bot");
        assert_eq!(normalize_base(Some("//bot//"), "bot"), "/bot");
        assert_eq!(normalize_base(Some("a/b"), "x"), "/a/b");
        assert_eq!(normalize_base(Some("/"), "bot"), "/");
    }

    #[test]
    fn selects_current_environment() {
        let settings = Settings::from_toml_str(SETTINGS).unwrap();
        let (name, record) = settings.select().unwrap();
        assert_eq!(name, "home");
        assert_eq!(record.project_root, PathBuf::from("/srv/projects"));
        assert!(record.process_owner_user.is_none());
    }

    #[test]
    fn environment_selection_is_case_insensitive() {
        let text = SETTINGS.replace("current = \"home\"", "current = \"HOME\"");
        let settings = Settings::from_toml_str(&text).unwrap();
        let (name, _) = settings.select().unwrap();
        assert_eq!(name, "home");
    }

    #[test]
    fn missing_selector_is_fatal() {
        let settings = Settings::from_toml_str("[locations]").unwrap();
        assert!(matches!(
            settings.select(),
            Err(ConfigError::NoEnvironmentSelected)
        ));
    }

    #[test]
    fn unknown_environment_names_candidates() {
        let text = SETTINGS.replace("current = \"home\"", "current = \"lab\"");
        let settings = Settings::from_toml_str(&text).unwrap();
        let err = settings.select().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("lab"));
        assert!(msg.contains("home"));
        assert!(msg.contains("office"));
    }

    #[test]
    fn server_names_deduplicate_preserving_order() {
        let settings = Settings::from_toml_str(SETTINGS).unwrap();
        let (_, record) = settings.select().unwrap();
        assert_eq!(record.server_names(), vec!["home.local", "localhost"]);
    }

    #[test]
    fn server_names_fall_back_to_localhost() {
        let text = SETTINGS.replace("current = \"home\"", "current = \"office\"");
        let settings = Settings::from_toml_str(&text).unwrap();
        let (_, record) = settings.select().unwrap();
        assert_eq!(record.server_names(), vec!["localhost"]);
    }

    #[test]
    fn load_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("apps.toml");
        assert!(matches!(
            AppRegistry::load(&missing),
            Err(ConfigError::RegistryMissing(_))
        ));
        assert!(matches!(
            Settings::load(&dir.path().join("settings.toml")),
            Err(ConfigError::SettingsMissing(_))
        ));
    }

    #[test]
    fn load_validates_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apps.toml");
        std::fs::write(
            &path,
            "[a]\nport = 1\nsso_issuer = true\n[b]\nport = 2\nsso_issuer = true\n",
        )
        .unwrap();
        assert!(matches!(
            AppRegistry::load(&path),
            Err(ConfigError::MultipleSsoIssuers { .. })
        ));
    }

    #[test]
    fn malformed_entry_is_a_parse_error() {
        // a bare string where a table is required gets rejected up front
        assert!(AppRegistry::from_toml_str("bot = \"8502\"").is_err());
    }
}

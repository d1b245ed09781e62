//! Registry authentication
//!
//! Credentials for every registry a run touches are resolved once and
//! serialized into a single environment variable consumed by the lifecycle
//! binaries. Resolution order: explicit environment overrides, then the
//! Docker config file's auth entries.

use crate::errors::Result;
use crate::refs::ImageRef;
use base64::Engine;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::debug;

/// Environment variable the lifecycle reads registry credentials from.
pub const REGISTRY_AUTH_ENV: &str = "CNB_REGISTRY_AUTH";

/// Credentials for one registry.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RegistryCredentials {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
    },
}

impl RegistryCredentials {
    /// Authorization header value, or None for anonymous access.
    pub fn to_auth_header(&self) -> Option<String> {
        match self {
            RegistryCredentials::Anonymous => None,
            RegistryCredentials::Basic { username, password } => {
                let credentials = format!("{}:{}", username, password);
                let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
                Some(format!("Basic {}", encoded))
            }
            RegistryCredentials::Bearer { token } => Some(format!("Bearer {}", token)),
        }
    }
}

/// Resolves registry credentials for image references.
#[derive(Debug, Clone, Default)]
pub struct Keychain {
    default_credentials: RegistryCredentials,
    registry_credentials: HashMap<String, RegistryCredentials>,
}

#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl Keychain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a keychain from the environment and the Docker config file.
    ///
    /// `KILN_REGISTRY_TOKEN` (bearer) or `KILN_REGISTRY_USER` +
    /// `KILN_REGISTRY_PASS` (basic) set default credentials; per-registry
    /// entries come from `~/.docker/config.json`.
    pub fn from_env_and_docker_config() -> Self {
        let mut keychain = Self::new();

        if let Ok(token) = std::env::var("KILN_REGISTRY_TOKEN") {
            keychain.default_credentials = RegistryCredentials::Bearer { token };
        } else if let (Ok(username), Ok(password)) = (
            std::env::var("KILN_REGISTRY_USER"),
            std::env::var("KILN_REGISTRY_PASS"),
        ) {
            keychain.default_credentials = RegistryCredentials::Basic { username, password };
        }

        if let Some(home) = std::env::var_os("HOME") {
            let config_path = Path::new(&home).join(".docker").join("config.json");
            if let Err(e) = keychain.load_docker_config(&config_path) {
                debug!("skipping docker config: {}", e);
            }
        }

        keychain
    }

    /// Merge auth entries from a Docker config.json file.
    pub fn load_docker_config(&mut self, path: &Path) -> std::io::Result<()> {
        let contents = std::fs::read_to_string(path)?;
        let config: DockerConfig = serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        for (registry, entry) in config.auths {
            let credentials = if let Some(encoded) = entry.auth {
                match decode_basic_auth(&encoded) {
                    Some((username, password)) => RegistryCredentials::Basic { username, password },
                    None => continue,
                }
            } else if let (Some(username), Some(password)) = (entry.username, entry.password) {
                RegistryCredentials::Basic { username, password }
            } else {
                continue;
            };
            // config keys may carry a scheme prefix
            let registry = registry
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string();
            self.registry_credentials.insert(registry, credentials);
        }
        Ok(())
    }

    pub fn set_credentials(&mut self, registry: String, credentials: RegistryCredentials) {
        self.registry_credentials.insert(registry, credentials);
    }

    pub fn set_default_credentials(&mut self, credentials: RegistryCredentials) {
        self.default_credentials = credentials;
    }

    /// Credentials for a registry, falling back to the default.
    pub fn resolve(&self, registry: &str) -> &RegistryCredentials {
        self.registry_credentials
            .get(registry)
            .unwrap_or(&self.default_credentials)
    }
}

fn decode_basic_auth(encoded: &str) -> Option<(String, String)> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Serialize credentials for the given references into the value of the
/// registry-auth env var: a JSON object keyed by registry host.
///
/// Empty references are skipped; registries without credentials are omitted.
pub fn build_env_var(keychain: &Keychain, references: &[&str]) -> Result<String> {
    let mut by_registry = BTreeMap::new();
    for reference in references {
        if reference.is_empty() {
            continue;
        }
        let parsed = ImageRef::parse(reference)?;
        if let Some(header) = keychain.resolve(parsed.registry()).to_auth_header() {
            by_registry.insert(parsed.registry().to_string(), header);
        }
    }
    Ok(serde_json::to_string(&by_registry)
        .expect("string map serialization cannot fail"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(username: &str, password: &str) -> RegistryCredentials {
        RegistryCredentials::Basic {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn test_basic_auth_header() {
        let header = basic("user", "pass").to_auth_header().unwrap();
        assert_eq!(header, "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn test_anonymous_has_no_header() {
        assert_eq!(RegistryCredentials::Anonymous.to_auth_header(), None);
    }

    #[test]
    fn test_build_env_var_one_entry_per_registry() {
        let mut keychain = Keychain::new();
        keychain.set_credentials("registry.example".to_string(), basic("u", "p"));
        keychain.set_credentials("other.example".to_string(), basic("v", "q"));

        let value = build_env_var(
            &keychain,
            &[
                "registry.example/app:latest",
                "registry.example/run:latest",
                "other.example/cache",
                "",
            ],
        )
        .unwrap();

        let parsed: BTreeMap<String, String> = serde_json::from_str(&value).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed.contains_key("registry.example"));
        assert!(parsed.contains_key("other.example"));
    }

    #[test]
    fn test_build_env_var_omits_anonymous_registries() {
        let keychain = Keychain::new();
        let value = build_env_var(&keychain, &["registry.example/app"]).unwrap();
        assert_eq!(value, "{}");
    }

    #[test]
    fn test_docker_config_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"auths":{"https://registry.example/":{"auth":"dXNlcjpwYXNz"}}}"#,
        )
        .unwrap();

        let mut keychain = Keychain::new();
        keychain.load_docker_config(&path).unwrap();
        assert_eq!(keychain.resolve("registry.example"), &basic("user", "pass"));
    }

    #[test]
    fn test_default_credentials_fallback() {
        let mut keychain = Keychain::new();
        keychain.set_default_credentials(RegistryCredentials::Bearer {
            token: "tok".to_string(),
        });
        assert_eq!(
            keychain.resolve("anything.example").to_auth_header().unwrap(),
            "Bearer tok"
        );
    }
}

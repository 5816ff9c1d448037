//! Load config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bitshare_core::MeshConfig;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/bitshare/config.toml or /etc/bitshare/config.toml.
/// Env overrides: BITSHARE_NODE_NAME, BITSHARE_LISTEN_PORT, BITSHARE_DISCOVERY_PORT,
/// BITSHARE_ENABLE_RELAY, BITSHARE_RELAY_SERVERS (comma separated).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Where received files land. Empty: `<data_dir>/downloads`.
    pub download_dir: PathBuf,
    pub mesh: MeshConfig,
}

impl Config {
    pub fn download_dir(&self) -> PathBuf {
        if self.download_dir.as_os_str().is_empty() {
            self.mesh.data_dir.join("downloads")
        } else {
            self.download_dir.clone()
        }
    }
}

/// Load config: default, then the first config file found (or `explicit`), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let mut c = match explicit {
        Some(p) => load_from(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_from(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok())?;
    Ok(c)
}

fn load_from(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/bitshare/config.toml"));
    }
    out.push(PathBuf::from("/etc/bitshare/config.toml"));
    out
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(s) = var("BITSHARE_NODE_NAME") {
        c.mesh.node_name = s;
    }
    if let Some(s) = var("BITSHARE_LISTEN_PORT") {
        c.mesh.listen_port = s.parse().context("BITSHARE_LISTEN_PORT")?;
    }
    if let Some(s) = var("BITSHARE_DISCOVERY_PORT") {
        c.mesh.discovery_port = s.parse().context("BITSHARE_DISCOVERY_PORT")?;
    }
    if let Some(s) = var("BITSHARE_ENABLE_RELAY") {
        c.mesh.enable_relay = parse_bool(&s).context("BITSHARE_ENABLE_RELAY")?;
    }
    if let Some(s) = var("BITSHARE_RELAY_SERVERS") {
        c.mesh.relay_servers = s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    Ok(())
}

fn parse_bool(s: &str) -> Result<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("not a boolean: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
download_dir = "/srv/incoming"

[mesh]
node_name = "den"
listen_port = 9100
enable_bluetooth = false
"#,
        )
        .unwrap();
        let c = load_from(&path).unwrap();
        assert_eq!(c.mesh.node_name, "den");
        assert_eq!(c.mesh.listen_port, 9100);
        assert_eq!(c.mesh.discovery_port, 9876);
        assert!(!c.mesh.enable_bluetooth);
        assert_eq!(c.download_dir(), PathBuf::from("/srv/incoming"));
    }

    #[test]
    fn unknown_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[mesh]\nproxy_port = 3128\n").unwrap();
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("BITSHARE_NODE_NAME", "attic"),
            ("BITSHARE_LISTEN_PORT", "9200"),
            ("BITSHARE_ENABLE_RELAY", "off"),
            ("BITSHARE_RELAY_SERVERS", "a.example:9100, b.example:9100,"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.mesh.node_name, "attic");
        assert_eq!(c.mesh.listen_port, 9200);
        assert!(!c.mesh.enable_relay);
        assert_eq!(c.mesh.relay_servers, vec!["a.example:9100", "b.example:9100"]);
    }

    #[test]
    fn bad_env_port_is_an_error() {
        let mut c = Config::default();
        assert!(apply_env(&mut c, |k| (k == "BITSHARE_LISTEN_PORT").then(|| "http".to_string())).is_err());
    }

    #[test]
    fn default_download_dir_under_data_dir() {
        let c = Config::default();
        assert_eq!(c.download_dir(), c.mesh.data_dir.join("downloads"));
    }
}

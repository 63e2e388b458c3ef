//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use lanlink_core::{Timings, DEFAULT_PORT};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/lanlink/config.toml or /etc/lanlink/config.toml.
/// Env overrides: LANLINK_USERNAME, LANLINK_DISPLAY_NAME, LANLINK_PORT, LANLINK_VERBOSE, LANLINK_LOSS_RATE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Left half of `username@ip`. Defaults to $USER.
    #[serde(default = "default_username")]
    pub username: String,
    /// Shown in PROFILE; defaults to the username.
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_status")]
    pub status: String,
    /// Image announced with PROFILE and attached to DMs.
    #[serde(default)]
    pub avatar_path: Option<PathBuf>,
    /// UDP port every peer listens on (default 50999).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Used with the local address to derive the broadcast address.
    #[serde(default = "default_subnet_mask")]
    pub subnet_mask: Ipv4Addr,
    #[serde(default)]
    pub verbose: bool,
    /// Drop probability for game/file datagrams, for exercising retries. 0 disables.
    #[serde(default)]
    pub loss_rate: f64,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default)]
    pub protocol: Timings,
}

fn default_username() -> String {
    std::env::var("USER").unwrap_or_else(|_| "user".to_string())
}
fn default_status() -> String {
    "BROADCASTING".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_subnet_mask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 0)
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("received_files")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: default_username(),
            display_name: None,
            status: default_status(),
            avatar_path: None,
            port: default_port(),
            subnet_mask: default_subnet_mask(),
            verbose: false,
            loss_rate: 0.0,
            download_dir: default_download_dir(),
            protocol: Timings::default(),
        }
    }
}

impl Config {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("LANLINK_USERNAME").filter(|s| !s.is_empty()) {
        c.username = s;
    }
    if let Some(s) = var("LANLINK_DISPLAY_NAME").filter(|s| !s.is_empty()) {
        c.display_name = Some(s);
    }
    if let Some(s) = var("LANLINK_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Some(s) = var("LANLINK_VERBOSE") {
        c.verbose = matches!(s.as_str(), "1" | "true" | "yes");
    }
    if let Some(s) = var("LANLINK_LOSS_RATE") {
        if let Ok(r) = s.parse::<f64>() {
            c.loss_rate = r.clamp(0.0, 1.0);
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lanlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            return load_path(&p);
        }
    }
    None
}

/// Parse one config file. Unreadable or invalid files are logged and ignored.
pub fn load_path(path: &Path) -> Option<Config> {
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read config");
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn file_values_and_defaults() {
        let f = write_config(
            r#"
username = "alice"
subnet_mask = "255.255.0.0"
loss_rate = 0.25

[protocol]
peer_ttl_secs = 30
chunk_size = 512
"#,
        );
        let c = load_path(f.path()).unwrap();
        assert_eq!(c.username, "alice");
        assert_eq!(c.display_name(), "alice");
        assert_eq!(c.port, 50999);
        assert_eq!(c.subnet_mask, Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(c.protocol.peer_ttl_secs, 30);
        assert_eq!(c.protocol.chunk_size, 512);
        assert_eq!(c.protocol.token_ttl_secs, 60);
        assert_eq!(c.protocol.cleanup_interval_secs(), 15);
    }

    #[test]
    fn unknown_keys_rejected() {
        let f = write_config("usernme = \"typo\"\n");
        assert!(load_path(f.path()).is_none());
        let f = write_config("[protocol]\nretries = 9\n");
        assert!(load_path(f.path()).is_none());
    }

    #[test]
    fn env_overrides_file() {
        let mut c = Config::default();
        let env: HashMap<&str, &str> = [
            ("LANLINK_USERNAME", "bob"),
            ("LANLINK_DISPLAY_NAME", "Bobby"),
            ("LANLINK_PORT", "6000"),
            ("LANLINK_VERBOSE", "1"),
            ("LANLINK_LOSS_RATE", "7"),
        ]
        .into_iter()
        .collect();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.username, "bob");
        assert_eq!(c.display_name(), "Bobby");
        assert_eq!(c.port, 6000);
        assert!(c.verbose);
        assert_eq!(c.loss_rate, 1.0);
    }

    #[test]
    fn bad_env_values_ignored() {
        let mut c = Config::default();
        apply_env(&mut c, |k| (k == "LANLINK_PORT").then(|| "not-a-port".to_string()));
        assert_eq!(c.port, 50999);
    }
}

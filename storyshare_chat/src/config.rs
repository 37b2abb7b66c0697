use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use chat_api::{UserId, UserSummary};
use clap::Parser;
use serde::Deserialize;

use crate::audio::AudioPolicy;

/// Command line options for the chat server.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Print a bearer token for the given user id and exit.
    #[arg(long)]
    pub issue_token: Option<UserId>,
}

/// Runtime configuration for the server resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Base directory for the database, signing secret and audio blobs.
    pub data_dir: PathBuf,
    /// Maximum upload size in megabytes.
    pub max_upload_mb: u64,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
    /// Externally reachable origin used to build audio URLs.
    pub public_base_url: String,
    /// Content types accepted for voice clips.
    pub audio_mime_types: Vec<String>,
    /// Window in which repeated typing signals are collapsed.
    pub typing_debounce: Duration,
    /// How often unreferenced audio blobs are swept.
    pub housekeeping_interval: Duration,
    /// Users upserted into the directory at startup.
    pub seed_users: Vec<UserSummary>,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    uploads: FileUploads,
    #[serde(default)]
    realtime: FileRealtime,
    #[serde(default)]
    housekeeping: FileHousekeeping,
    #[serde(default)]
    users: Vec<UserSummary>,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    public_base_url: Option<String>,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize)]
struct FileUploads {
    #[serde(default = "default_max_upload_mb")]
    max_mb: u64,
    #[serde(default = "default_audio_mime_types")]
    audio_mime_types: Vec<String>,
}

#[derive(Deserialize)]
struct FileRealtime {
    #[serde(default = "default_typing_debounce_ms")]
    typing_debounce_ms: u64,
}

#[derive(Deserialize)]
struct FileHousekeeping {
    #[serde(default = "default_housekeeping_secs")]
    interval_secs: u64,
}

fn default_port() -> u16 {
    8787
}

fn default_logging() -> bool {
    true
}

fn default_max_upload_mb() -> u64 {
    10
}

fn default_audio_mime_types() -> Vec<String> {
    [
        "audio/webm",
        "audio/ogg",
        "audio/mpeg",
        "audio/mp4",
        "audio/aac",
        "audio/wav",
        "audio/x-wav",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_typing_debounce_ms() -> u64 {
    1000
}

fn default_housekeeping_secs() -> u64 {
    300
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
            public_base_url: None,
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Default for FileUploads {
    fn default() -> Self {
        Self {
            max_mb: default_max_upload_mb(),
            audio_mime_types: default_audio_mime_types(),
        }
    }
}

impl Default for FileRealtime {
    fn default() -> Self {
        Self {
            typing_debounce_ms: default_typing_debounce_ms(),
        }
    }
}

impl Default for FileHousekeeping {
    fn default() -> Self {
        Self {
            interval_secs: default_housekeeping_secs(),
        }
    }
}

impl Config {
    /// Configuration with built-in defaults for the given address and data
    /// directory.
    pub fn new(bind: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        let bind = bind.into();
        Self {
            public_base_url: format!("http://{}/", bind),
            bind,
            data_dir: data_dir.into(),
            max_upload_mb: default_max_upload_mb(),
            logging_enabled: default_logging(),
            audio_mime_types: default_audio_mime_types(),
            typing_debounce: Duration::from_millis(default_typing_debounce_ms()),
            housekeeping_interval: Duration::from_secs(default_housekeeping_secs()),
            seed_users: Vec::new(),
        }
    }

    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("STORYSHARE_CHAT_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/storyshare_chat.toml"));

        let file_cfg = match fs::read(&config_path) {
            Ok(bytes) => {
                let contents = String::from_utf8_lossy(&bytes);
                toml::from_str::<FileConfig>(&contents).context("invalid config file")?
            }
            Err(_) => FileConfig::default(),
        };
        let mut port = file_cfg.server.port;
        let mut logging = file_cfg.logging.enabled;
        let mut max_upload_mb = file_cfg.uploads.max_mb;
        let mut public_base_url = file_cfg.server.public_base_url;

        // environment overrides
        if let Ok(p) = std::env::var("STORYSHARE_CHAT_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("STORYSHARE_CHAT_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }
        if let Some(mb) = std::env::var("MAX_UPLOAD_MB")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            max_upload_mb = mb;
        }
        if let Ok(url) = std::env::var("PUBLIC_BASE_URL") {
            public_base_url = Some(url);
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }

        // validate port range
        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }

        // bind address precedence for host override
        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        let mut cfg = Self::new(bind, data_dir);
        cfg.max_upload_mb = max_upload_mb;
        cfg.logging_enabled = logging;
        if let Some(url) = public_base_url {
            cfg.public_base_url = url;
        }
        cfg.audio_mime_types = file_cfg.uploads.audio_mime_types;
        cfg.typing_debounce = Duration::from_millis(file_cfg.realtime.typing_debounce_ms);
        cfg.housekeeping_interval = Duration::from_secs(file_cfg.housekeeping.interval_secs);
        cfg.seed_users = file_cfg.users;
        Ok(cfg)
    }

    /// Helper to return the upload limit in bytes.
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb * 1024 * 1024
    }

    pub fn db_file(&self) -> PathBuf {
        self.data_dir.join("storyshare.db")
    }

    pub fn auth_file(&self) -> PathBuf {
        self.data_dir.join("auth.json")
    }

    pub fn files_dir(&self) -> PathBuf {
        self.data_dir.join("files")
    }

    pub fn audio_policy(&self) -> AudioPolicy {
        AudioPolicy {
            allowed_mime: self.audio_mime_types.clone(),
            max_bytes: self.max_upload_bytes(),
        }
    }
}

/// Determine the default data directory for the server.
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".local/share/storyshare_chat");
        p
    } else {
        PathBuf::from("./storyshare_chat_data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    fn clear_env() {
        for key in [
            "STORYSHARE_CHAT_PORT",
            "STORYSHARE_CHAT_LOGGING",
            "MAX_UPLOAD_MB",
            "PUBLIC_BASE_URL",
            "BIND",
        ] {
            std::env::remove_var(key);
        }
    }

    fn cli_for(contents: &str) -> (tempfile::TempDir, Cli) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, contents).unwrap();
        let cli = Cli {
            config: Some(path),
            ..Default::default()
        };
        (dir, cli)
    }

    #[test]
    #[serial]
    fn valid_config_parses() {
        clear_env();
        let (_dir, cli) = cli_for(
            "[server]\nport=5555\n[logging]\nenabled=false\n[realtime]\ntyping_debounce_ms=250\n",
        );
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:5555");
        assert_eq!(cfg.public_base_url, "http://127.0.0.1:5555/");
        assert!(!cfg.logging_enabled);
        assert_eq!(cfg.typing_debounce, Duration::from_millis(250));
    }

    #[test]
    #[serial]
    fn invalid_port_fails() {
        clear_env();
        let (_dir, cli) = cli_for("[server]\nport=80\n");
        assert!(Config::load(&cli).is_err());
    }

    #[test]
    #[serial]
    fn missing_keys_defaults() {
        clear_env();
        let (_dir, cli) = cli_for("");
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:8787");
        assert!(cfg.logging_enabled);
        assert_eq!(cfg.max_upload_bytes(), 10 * 1024 * 1024);
        assert!(cfg.audio_mime_types.iter().any(|m| m == "audio/webm"));
    }

    #[test]
    #[serial]
    fn precedence_cli_env_file() {
        clear_env();
        let (_dir, mut cli) = cli_for("[server]\nport=1111\n");
        std::env::set_var("STORYSHARE_CHAT_PORT", "2222");
        cli.port = Some(3333);
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:3333");
        cli.port = None;
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:2222");
        clear_env();
    }

    #[test]
    #[serial]
    fn uploads_and_public_url() {
        clear_env();
        let (_dir, cli) = cli_for(
            "[server]\npublic_base_url=\"https://chat.example.com\"\n[uploads]\nmax_mb=2\naudio_mime_types=[\"audio/ogg\"]\n",
        );
        std::env::set_var("MAX_UPLOAD_MB", "3");
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.public_base_url, "https://chat.example.com");
        assert_eq!(cfg.max_upload_mb, 3);
        assert_eq!(cfg.audio_policy().allowed_mime, vec!["audio/ogg".to_string()]);
        clear_env();
    }

    #[test]
    #[serial]
    fn seed_users_from_file() {
        clear_env();
        let (_dir, cli) = cli_for(
            "[[users]]\nid=1\nusername=\"alice\"\nname=\"Alice\"\n\n[[users]]\nid=2\nusername=\"bob\"\nname=\"Bob\"\navatar_url=\"http://img/bob.png\"\n",
        );
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.seed_users.len(), 2);
        assert_eq!(cfg.seed_users[1].avatar_url.as_deref(), Some("http://img/bob.png"));
    }
}

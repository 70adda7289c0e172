#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use hrchat_domain::Role;
use hrchat_protocol::UserProfile;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.hrchat/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".hrchat").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
	pub chat: ChatSettings,
	/// Seeded user directory; in production this is fed by the HR user module.
	pub directory: Vec<UserProfile>,
}

/// Server settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable persistence; without it the in-memory stores run.
	pub enabled: bool,
	/// Database URL (sqlite:).
	pub database_url: Option<String>,
}

/// Chat subsystem tuning.
#[derive(Debug, Clone)]
pub struct ChatSettings {
	/// Maximum number of queued push events per connection.
	pub subscriber_queue_capacity: usize,
	/// Message page size when the caller does not pass `limit`.
	pub default_page_limit: u32,
	/// Hard cap on the message page size.
	pub max_page_limit: u32,
}

impl Default for ChatSettings {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 256,
			default_page_limit: 50,
			max_page_limit: 200,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	chat: FileChatSettings,

	#[serde(default)]
	directory: Vec<FileDirectoryUser>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileChatSettings {
	subscriber_queue_capacity: Option<usize>,
	default_page_limit: Option<u32>,
	max_page_limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileDirectoryUser {
	id: String,
	role: String,
	display_name: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ChatSettings::default();

		let mut directory = Vec::with_capacity(file.directory.len());
		for entry in file.directory {
			let Ok(id) = hrchat_domain::UserId::new(entry.id.clone()) else {
				warn!(id = %entry.id, "directory: skipping entry with empty id");
				continue;
			};
			let Ok(role) = entry.role.parse::<Role>() else {
				warn!(id = %entry.id, role = %entry.role, "directory: skipping entry with unknown role");
				continue;
			};

			let display_name = entry
				.display_name
				.filter(|s| !s.trim().is_empty())
				.unwrap_or_else(|| id.to_string());
			directory.push(UserProfile { id, role, display_name });
		}

		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
			chat: ChatSettings {
				subscriber_queue_capacity: file
					.chat
					.subscriber_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.subscriber_queue_capacity),
				default_page_limit: file
					.chat
					.default_page_limit
					.filter(|v| *v > 0)
					.unwrap_or(defaults.default_page_limit),
				max_page_limit: file.chat.max_page_limit.filter(|v| *v > 0).unwrap_or(defaults.max_page_limit),
			},
			directory,
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("HRCHAT_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HRCHAT_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("HRCHAT_PERSISTENCE_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("HRCHAT_SUBSCRIBER_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.chat.subscriber_queue_capacity = capacity;
		info!(capacity, "chat config: subscriber_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("HRCHAT_DEFAULT_PAGE_LIMIT")
		&& let Ok(limit) = v.trim().parse::<u32>()
		&& limit > 0
	{
		cfg.chat.default_page_limit = limit;
		info!(limit, "chat config: default_page_limit overridden by env");
	}

	if let Ok(v) = std::env::var("HRCHAT_MAX_PAGE_LIMIT")
		&& let Ok(limit) = v.trim().parse::<u32>()
		&& limit > 0
	{
		cfg.chat.max_page_limit = limit;
		info!(limit, "chat config: max_page_limit overridden by env");
	}
}

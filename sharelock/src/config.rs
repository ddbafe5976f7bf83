use std::path::Path;
use std::str::FromStr;

use sharelock_core::EngineConfig;
use tracing::warn;

use crate::error::ConfigError;

/// The on-disk/on-wire shape of the config file, matching the flat field naming the
/// source service used so an operator migrating a `config.yaml` does not need to
/// rename anything.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(default)]
struct RawConfig {
	http_server_enable: bool,
	http_server_port: u16,
	http_server_service_name: String,

	grpc_server_enable: bool,
	grpc_server_port: u16,
	grpc_server_service_name: String,
	grpc_tls: bool,
	grpc_cert_path: String,
	grpc_key_path: String,

	log_format: agent_core::telemetry::LogFormat,
	log_level: String,

	engine: EngineSection,
}

#[derive(Clone, Copy, Debug, serde::Deserialize, serde::Serialize)]
#[serde(default)]
struct EngineSection {
	submission_channel_capacity: usize,
	holder_timeout_cap_ms: u64,
	idle_tick_ms: u64,
}

impl Default for EngineSection {
	fn default() -> Self {
		let d = EngineConfig::default();
		EngineSection {
			submission_channel_capacity: d.submission_channel_capacity,
			holder_timeout_cap_ms: d.holder_timeout_cap_ms,
			idle_tick_ms: d.idle_tick_ms,
		}
	}
}

impl Default for RawConfig {
	fn default() -> Self {
		RawConfig {
			http_server_enable: false,
			http_server_port: 8080,
			http_server_service_name: String::new(),
			grpc_server_enable: false,
			grpc_server_port: 9090,
			grpc_server_service_name: String::new(),
			grpc_tls: false,
			grpc_cert_path: String::new(),
			grpc_key_path: String::new(),
			log_format: agent_core::telemetry::LogFormat::default(),
			log_level: "info".to_string(),
			engine: EngineSection::default(),
		}
	}
}

/// Overrides `value` with the parsed contents of environment variable `name`, if set
/// and parseable; logs and keeps `value` otherwise. Mirrors `config.go`'s fallback to
/// environment variables, but applied per field instead of all-or-nothing.
fn overlay<T: FromStr>(value: T, name: &str) -> T {
	match std::env::var(name) {
		Err(_) => value,
		Ok(raw) => match raw.parse() {
			Ok(parsed) => parsed,
			Err(_) => {
				warn!(env = name, raw, "ignoring unparsable environment override");
				value
			}
		},
	}
}

impl RawConfig {
	fn apply_env_overlay(mut self) -> Self {
		self.http_server_enable = overlay(self.http_server_enable, "HTTP_SERVER_ENABLE");
		self.http_server_port = overlay(self.http_server_port, "HTTP_SERVER_PORT");
		self.http_server_service_name = overlay(self.http_server_service_name, "HTTP_SERVER_SERVICE_NAME");
		self.grpc_server_enable = overlay(self.grpc_server_enable, "GRPC_SERVER_ENABLE");
		self.grpc_server_port = overlay(self.grpc_server_port, "GRPC_SERVER_PORT");
		self.grpc_server_service_name = overlay(self.grpc_server_service_name, "GRPC_SERVER_SERVICE_NAME");
		self.grpc_tls = overlay(self.grpc_tls, "GRPC_TLS");
		self.grpc_cert_path = overlay(self.grpc_cert_path, "GRPC_CERT_PATH");
		self.grpc_key_path = overlay(self.grpc_key_path, "GRPC_KEY_PATH");
		self.log_level = overlay(self.log_level, "LOG_LEVEL");
		self.engine.submission_channel_capacity = overlay(self.engine.submission_channel_capacity, "ENGINE_SUBMISSION_CHANNEL_CAPACITY");
		self.engine.holder_timeout_cap_ms = overlay(self.engine.holder_timeout_cap_ms, "ENGINE_HOLDER_TIMEOUT_CAP_MS");
		self.engine.idle_tick_ms = overlay(self.engine.idle_tick_ms, "ENGINE_IDLE_TICK_MS");
		if let Ok(raw) = std::env::var("LOG_FORMAT") {
			match raw.as_str() {
				"text" => self.log_format = agent_core::telemetry::LogFormat::Text,
				"json" => self.log_format = agent_core::telemetry::LogFormat::Json,
				_ => warn!(raw, "ignoring unrecognised LOG_FORMAT override"),
			}
		}
		self
	}
}

#[derive(Clone, Debug)]
pub struct FrontEndConfig {
	pub enable: bool,
	pub port: u16,
	pub service_name: String,
}

#[derive(Clone, Debug)]
pub struct TlsConfig {
	pub cert_path: String,
	pub key_path: String,
}

#[derive(Clone, Debug)]
pub struct Config {
	pub http: FrontEndConfig,
	pub grpc: FrontEndConfig,
	pub grpc_tls: Option<TlsConfig>,
	pub log_format: agent_core::telemetry::LogFormat,
	pub log_level: String,
	pub engine: EngineConfig,
}

/// Loads config from `path` if it exists, falling back to environment-only
/// construction if it does not — **(SUPPLEMENT)** the same try-file-then-env
/// fallback `config.go`'s `ReadConfig` performs, generalised to per-field overlay on
/// top of whichever base was found.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
	let raw = match fs_err::read_to_string(path) {
		Ok(contents) => serde_yaml::from_str(&contents)?,
		Err(source) => {
			warn!(path = %path.display(), %source, "config file unavailable, using defaults and environment");
			RawConfig::default()
		}
	};
	finish(raw)
}

pub fn parse(contents: &str) -> Result<Config, ConfigError> {
	let raw: RawConfig = serde_yaml::from_str(contents)?;
	finish(raw)
}

fn finish(raw: RawConfig) -> Result<Config, ConfigError> {
	let raw = raw.apply_env_overlay();
	validate(&raw)?;

	Ok(Config {
		http: FrontEndConfig {
			enable: raw.http_server_enable,
			port: raw.http_server_port,
			service_name: raw.http_server_service_name,
		},
		grpc: FrontEndConfig {
			enable: raw.grpc_server_enable,
			port: raw.grpc_server_port,
			service_name: raw.grpc_server_service_name,
		},
		grpc_tls: raw.grpc_tls.then(|| TlsConfig {
			cert_path: raw.grpc_cert_path.clone(),
			key_path: raw.grpc_key_path.clone(),
		}),
		log_format: raw.log_format,
		log_level: raw.log_level,
		engine: EngineConfig {
			submission_channel_capacity: raw.engine.submission_channel_capacity,
			per_key_inbox_capacity: EngineConfig::default().per_key_inbox_capacity,
			holder_timeout_cap_ms: raw.engine.holder_timeout_cap_ms,
			idle_tick_ms: raw.engine.idle_tick_ms,
		},
	})
}

/// Mirrors `config.go`'s `validate`: a front end that is enabled must have a port and
/// a service name, and TLS, if requested, must have both credential paths.
fn validate(raw: &RawConfig) -> Result<(), ConfigError> {
	if raw.http_server_enable {
		if raw.http_server_port == 0 {
			return Err(ConfigError::Invalid("http_server_port is invalid".into()));
		}
		if raw.http_server_service_name.is_empty() {
			return Err(ConfigError::Invalid("http_server_service_name is not set".into()));
		}
	}

	if raw.grpc_server_enable {
		if raw.grpc_server_port == 0 {
			return Err(ConfigError::Invalid("grpc_server_port is invalid".into()));
		}
		if raw.grpc_server_service_name.is_empty() {
			return Err(ConfigError::Invalid("grpc_server_service_name is not set".into()));
		}
		if raw.grpc_tls {
			if raw.grpc_cert_path.is_empty() {
				return Err(ConfigError::Invalid("grpc_cert_path is not set".into()));
			}
			if raw.grpc_key_path.is_empty() {
				return Err(ConfigError::Invalid("grpc_key_path is not set".into()));
			}
		}
	}

	if !raw.http_server_enable && !raw.grpc_server_enable {
		return Err(ConfigError::Invalid("at least one of http_server_enable or grpc_server_enable must be true".into()));
	}

	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;

	fn minimal_yaml() -> &'static str {
		r#"
http_server_enable: true
http_server_port: 8080
http_server_service_name: sharelock-http
"#
	}

	#[test]
	fn parses_minimal_config() {
		let cfg = parse(minimal_yaml()).unwrap();
		assert!(cfg.http.enable);
		assert_eq!(cfg.http.port, 8080);
		assert!(!cfg.grpc.enable);
	}

	#[test]
	fn rejects_enabled_front_end_without_service_name() {
		let yaml = "http_server_enable: true\nhttp_server_port: 8080\n";
		assert!(parse(yaml).is_err());
	}

	#[test]
	fn rejects_tls_without_credential_paths() {
		let yaml = r#"
grpc_server_enable: true
grpc_server_port: 9090
grpc_server_service_name: sharelock-grpc
grpc_tls: true
"#;
		assert!(parse(yaml).is_err());
	}

	#[test]
	fn rejects_no_front_end_enabled() {
		assert!(parse("{}").is_err());
	}

	#[test]
	fn env_override_takes_precedence_over_file() {
		// SAFETY: tests in this module run single-threaded via #[test] and do not
		// share this variable with any other test.
		unsafe { std::env::set_var("HTTP_SERVER_PORT", "9999") };
		let cfg = parse(minimal_yaml()).unwrap();
		unsafe { std::env::remove_var("HTTP_SERVER_PORT") };
		assert_eq!(cfg.http.port, 9999);
	}
}

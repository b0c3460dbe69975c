use gemini_realtime::is_supported_voice;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Per-connection relay limits and behavior switches.
#[derive(Clone, Debug, PartialEq)]
pub struct RelaySettings {
    pub max_audio_bytes: usize,
    pub max_image_bytes: usize,
    pub max_text_chars: usize,
    pub send_timeout: Duration,
    pub setup_timeout: Duration,
    pub captions_enabled: bool,
    pub audio_mime_type: String,
    pub image_mime_type: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            max_audio_bytes: 10 * 1024 * 1024,
            max_image_bytes: 5 * 1024 * 1024,
            max_text_chars: 100_000,
            send_timeout: Duration::from_secs(5),
            setup_timeout: Duration::from_secs(10),
            captions_enabled: true,
            audio_mime_type: "audio/pcm;rate=16000".to_string(),
            image_mime_type: "image/jpeg".to_string(),
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub gemini_voice: String,
    pub automatic_vad: bool,
    pub log_level: Level,
    pub prompts_path: PathBuf,
    pub relay: RelaySettings,
    pub max_sessions: usize,
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn parse_positive(name: &str, default: u64) -> Result<u64, ConfigError> {
    let value = parse_var(name, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than 0".to_string(),
        ));
    }
    Ok(value)
}

fn parse_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue(
                name.to_string(),
                format!("'{}' is not a boolean", other),
            )),
        },
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let gemini_api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| ConfigError::MissingVar("GEMINI_API_KEY".to_string()))?;

        let gemini_model = std::env::var("GEMINI_MODEL")
            .unwrap_or_else(|_| "models/gemini-2.0-flash-live-001".to_string());

        let gemini_voice = std::env::var("GEMINI_VOICE").unwrap_or_else(|_| "Puck".to_string());
        if !is_supported_voice(&gemini_voice) {
            return Err(ConfigError::InvalidValue(
                "GEMINI_VOICE".to_string(),
                format!("'{}' is not a supported prebuilt voice", gemini_voice),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = std::env::var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts"));

        let defaults = RelaySettings::default();
        let relay = RelaySettings {
            max_audio_bytes: parse_var("MAX_AUDIO_BYTES", defaults.max_audio_bytes)?,
            max_image_bytes: parse_var("MAX_IMAGE_BYTES", defaults.max_image_bytes)?,
            max_text_chars: parse_var("MAX_TEXT_CHARS", defaults.max_text_chars)?,
            send_timeout: Duration::from_secs(parse_positive("SEND_TIMEOUT_SECONDS", 5)?),
            setup_timeout: Duration::from_secs(parse_positive("SETUP_TIMEOUT_SECONDS", 10)?),
            captions_enabled: parse_bool("CAPTIONS_ENABLED", defaults.captions_enabled)?,
            audio_mime_type: std::env::var("AUDIO_MIME_TYPE").unwrap_or(defaults.audio_mime_type),
            image_mime_type: defaults.image_mime_type,
        };

        Ok(Self {
            bind_address,
            gemini_api_key,
            gemini_model,
            gemini_voice,
            automatic_vad: parse_bool("AUTOMATIC_VAD", true)?,
            log_level,
            prompts_path,
            relay,
            max_sessions: parse_positive("MAX_SESSIONS", 1000)? as usize,
            session_timeout: Duration::from_secs(parse_positive("SESSION_TIMEOUT_SECONDS", 600)?),
            sweep_interval: Duration::from_secs(parse_positive("SWEEP_INTERVAL_SECONDS", 300)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tracing::Level;

    const VARS: &[&str] = &[
        "BIND_ADDRESS",
        "GEMINI_API_KEY",
        "GEMINI_MODEL",
        "GEMINI_VOICE",
        "RUST_LOG",
        "PROMPTS_PATH",
        "MAX_AUDIO_BYTES",
        "MAX_IMAGE_BYTES",
        "MAX_TEXT_CHARS",
        "SEND_TIMEOUT_SECONDS",
        "SETUP_TIMEOUT_SECONDS",
        "CAPTIONS_ENABLED",
        "AUDIO_MIME_TYPE",
        "AUTOMATIC_VAD",
        "MAX_SESSIONS",
        "SESSION_TIMEOUT_SECONDS",
        "SWEEP_INTERVAL_SECONDS",
    ];

    fn clear_env_vars() {
        unsafe {
            for var in VARS {
                env::remove_var(var);
            }
        }
    }

    fn set_minimal_env() {
        unsafe {
            env::set_var("GEMINI_API_KEY", "test-gemini-key");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_minimal() {
        clear_env_vars();
        set_minimal_env();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "0.0.0.0:8080");
        assert_eq!(config.gemini_api_key, "test-gemini-key");
        assert_eq!(config.gemini_model, "models/gemini-2.0-flash-live-001");
        assert_eq!(config.gemini_voice, "Puck");
        assert!(config.automatic_vad);
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.prompts_path, PathBuf::from("./prompts"));
        assert_eq!(config.relay, RelaySettings::default());
        assert_eq!(config.max_sessions, 1000);
        assert_eq!(config.session_timeout, Duration::from_secs(600));
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("BIND_ADDRESS", "127.0.0.1:9000");
            env::set_var("GEMINI_VOICE", "Kore");
            env::set_var("RUST_LOG", "debug");
            env::set_var("MAX_AUDIO_BYTES", "2048");
            env::set_var("MAX_TEXT_CHARS", "500");
            env::set_var("SEND_TIMEOUT_SECONDS", "2");
            env::set_var("CAPTIONS_ENABLED", "false");
            env::set_var("AUTOMATIC_VAD", "off");
            env::set_var("MAX_SESSIONS", "25");
            env::set_var("SWEEP_INTERVAL_SECONDS", "30");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "127.0.0.1:9000");
        assert_eq!(config.gemini_voice, "Kore");
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.relay.max_audio_bytes, 2048);
        assert_eq!(config.relay.max_text_chars, 500);
        assert_eq!(config.relay.send_timeout, Duration::from_secs(2));
        assert!(!config.relay.captions_enabled);
        assert!(!config.automatic_vad);
        assert_eq!(config.max_sessions, 25);
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
    }

    #[test]
    #[serial]
    fn test_config_missing_api_key() {
        clear_env_vars();

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(msg) => assert!(msg.contains("GEMINI_API_KEY")),
            _ => panic!("Expected MissingVar for GEMINI_API_KEY"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_bind_address() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("BIND_ADDRESS", "not-a-valid-address");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "BIND_ADDRESS"),
            _ => panic!("Expected InvalidValue for BIND_ADDRESS"),
        }
    }

    #[test]
    #[serial]
    fn test_config_unsupported_voice() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("GEMINI_VOICE", "Alloy");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, msg) => {
                assert_eq!(var, "GEMINI_VOICE");
                assert!(msg.contains("Alloy"));
            }
            _ => panic!("Expected InvalidValue for GEMINI_VOICE"),
        }
    }

    #[test]
    #[serial]
    fn test_config_rejects_non_numeric_limit() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("MAX_IMAGE_BYTES", "five megabytes");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "MAX_IMAGE_BYTES"),
            _ => panic!("Expected InvalidValue for MAX_IMAGE_BYTES"),
        }
    }

    #[test]
    #[serial]
    fn test_config_rejects_zero_timeout() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("SESSION_TIMEOUT_SECONDS", "0");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, msg) => {
                assert_eq!(var, "SESSION_TIMEOUT_SECONDS");
                assert!(msg.contains("greater than 0"));
            }
            _ => panic!("Expected InvalidValue for SESSION_TIMEOUT_SECONDS"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_boolean() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("CAPTIONS_ENABLED", "maybe");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "CAPTIONS_ENABLED"),
            _ => panic!("Expected InvalidValue for CAPTIONS_ENABLED"),
        }
    }
}

use std::fmt;
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

/// Where caller audio is transcribed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SttMode {
    /// A Deepgram model hosted on a SageMaker endpoint.
    SageMaker,
    /// Deepgram's hosted streaming API.
    Cloud,
}

impl SttMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SageMaker => "SageMaker",
            Self::Cloud => "Cloud",
        }
    }
}

impl fmt::Display for SttMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub openai_api_key: String,
    pub openai_api_base: String,
    pub chat_model: String,
    pub deepgram_api_key: String,
    pub deepgram_stt_url: String,
    pub deepgram_tts_url: String,
    pub stt_model: String,
    pub tts_voice: String,
    pub stt_mode: SttMode,
    pub sagemaker_endpoint_name: String,
    pub aws_region: String,
    pub data_path: PathBuf,
    pub prompts_path: PathBuf,
    pub goodbye_delay: Duration,
    pub max_tool_rounds: usize,
    pub call_timeout: Duration,
    pub log_level: Level,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn required_var(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()))
}

fn parse_var<T>(name: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var_or(name, default)
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address = parse_var::<SocketAddr>("BIND_ADDRESS", "0.0.0.0:8000")?;

        let openai_api_key = required_var("OPENAI_API_KEY")?;
        let openai_api_base = var_or("OPENAI_API_BASE", "https://api.openai.com/v1");
        let chat_model = var_or("CHAT_MODEL", "gpt-4o-mini");

        let deepgram_api_key = required_var("DEEPGRAM_API_KEY")?;
        let deepgram_stt_url = var_or("DEEPGRAM_STT_URL", "wss://api.deepgram.com");
        let deepgram_tts_url = var_or("DEEPGRAM_TTS_URL", "https://api.deepgram.com");
        let stt_model = var_or("STT_MODEL", "nova-3");
        let tts_voice = var_or("TTS_VOICE", "aura-2-thalia-en");

        let stt_mode = if var_or("USE_SAGEMAKER_STT", "false").eq_ignore_ascii_case("true") {
            SttMode::SageMaker
        } else {
            SttMode::Cloud
        };
        let sagemaker_endpoint_name = var_or("SAGEMAKER_ENDPOINT_NAME", "deepgram-stt");
        let aws_region = var_or("AWS_REGION", "us-east-2");

        let data_path = PathBuf::from(var_or("PHARMACY_DATA_PATH", "./data/pharmacy-data.json"));
        let prompts_path = PathBuf::from(var_or("PROMPTS_PATH", "./prompts"));

        let goodbye_delay = Duration::from_millis(parse_var("GOODBYE_DELAY_MS", "1500")?);

        let max_tool_rounds: usize = parse_var("MAX_TOOL_ROUNDS", "8")?;
        if max_tool_rounds == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_TOOL_ROUNDS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let timeout_secs: u64 = parse_var("EXTERNAL_CALL_TIMEOUT_SECS", "30")?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "EXTERNAL_CALL_TIMEOUT_SECS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            openai_api_key,
            openai_api_base,
            chat_model,
            deepgram_api_key,
            deepgram_stt_url,
            deepgram_tts_url,
            stt_model,
            tts_voice,
            stt_mode,
            sagemaker_endpoint_name,
            aws_region,
            data_path,
            prompts_path,
            goodbye_delay,
            max_tool_rounds,
            call_timeout: Duration::from_secs(timeout_secs),
            log_level,
        })
    }
}

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use imagegen_comfyui::workflow::{InjectionPoint, DEFAULT_PROMPT_INPUT_KEY, DEFAULT_PROMPT_NODE_ID};

use crate::poll::PollConfig;

/// Default compute server when `COMFYUI_SERVER_URL` is unset.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8188";

/// Default wall-clock budget for one job, submission to completion.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything one `generate` call needs besides the prompt and sink.
///
/// Build it with [`GenerationConfig::from_env`] in binaries, or with
/// [`GenerationConfig::new`] plus struct update syntax in code.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Base URL of the compute server.
    pub server_url: String,
    /// Credential forwarded in the submission's `extra_data`.
    pub api_key: Option<String>,
    /// Raw workflow template; empty selects the built-in template.
    pub workflow_template: String,
    /// Where the prompt text goes in the template.
    pub injection: InjectionPoint,
    /// Tag sent with each submission to identify this client.
    pub client_tag: String,
    /// Directory the worker binary saves artifacts into.
    pub output_dir: PathBuf,
    /// Status polling cadence and attempt cap.
    pub poll: PollConfig,
    /// Absolute budget for the wait, independent of the poll cap.
    pub timeout: Duration,
}

impl GenerationConfig {
    /// Defaults for everything except the server URL.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            api_key: None,
            workflow_template: String::new(),
            injection: InjectionPoint::default(),
            client_tag: default_client_tag(),
            output_dir: PathBuf::from("."),
            poll: PollConfig::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                  |
    /// |------------------------------|--------------------------|
    /// | `COMFYUI_SERVER_URL`         | `http://localhost:8188`  |
    /// | `COMFYUI_API_KEY`            | unset                    |
    /// | `COMFYUI_WORKFLOW_TEMPLATE`  | built-in template        |
    /// | `COMFYUI_PROMPT_NODE_ID`     | `6`                      |
    /// | `COMFYUI_PROMPT_INPUT_KEY`   | `text`                   |
    /// | `COMFYUI_CLIENT_TAG`         | `imagegen-<uuid>`        |
    /// | `COMFYUI_OUTPUT_DIR`         | `.`                      |
    /// | `COMFYUI_POLL_INTERVAL_SECS` | `2`                      |
    /// | `COMFYUI_POLL_MAX_ATTEMPTS`  | `150`                    |
    /// | `COMFYUI_TIMEOUT_SECS`       | `300`                    |
    ///
    /// Numbers that fail to parse fall back to their default with a
    /// warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading values from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let defaults = PollConfig::default();
        let poll = PollConfig {
            interval: Duration::from_secs(parse_or(
                &lookup,
                "COMFYUI_POLL_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )),
            max_attempts: parse_nonzero_or(
                &lookup,
                "COMFYUI_POLL_MAX_ATTEMPTS",
                defaults.max_attempts,
            ),
            ..defaults
        };

        let injection = InjectionPoint::new(
            var("COMFYUI_PROMPT_NODE_ID").unwrap_or_else(|| DEFAULT_PROMPT_NODE_ID.into()),
            var("COMFYUI_PROMPT_INPUT_KEY").unwrap_or_else(|| DEFAULT_PROMPT_INPUT_KEY.into()),
        );

        Self {
            server_url: var("COMFYUI_SERVER_URL").unwrap_or_else(|| DEFAULT_SERVER_URL.into()),
            api_key: var("COMFYUI_API_KEY"),
            workflow_template: lookup("COMFYUI_WORKFLOW_TEMPLATE").unwrap_or_default(),
            injection,
            client_tag: var("COMFYUI_CLIENT_TAG").unwrap_or_else(default_client_tag),
            output_dir: var("COMFYUI_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            poll,
            timeout: Duration::from_secs(parse_or(
                &lookup,
                "COMFYUI_TIMEOUT_SECS",
                DEFAULT_TIMEOUT.as_secs(),
            )),
        }
    }
}

fn default_client_tag() -> String {
    format!("imagegen-{}", uuid::Uuid::new_v4())
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, value = %raw, default = %default, "Invalid number in environment, using default");
            default
        }
    }
}

/// Like [`parse_or`], but zero also falls back to the default.
fn parse_nonzero_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    match parse_or(lookup, key, default) {
        0 => {
            tracing::warn!(key, default, "Zero is not allowed here, using default");
            default
        }
        value => value,
    }
}

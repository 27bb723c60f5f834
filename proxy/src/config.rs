//! Configuration loading
//!
//! The proxy reads one TOML file. It is located by, in order:
//! 1. an explicit `--config` path
//! 2. `.editor-proxy.toml` in the cwd or any parent directory
//! 3. `<config_dir>/editor-proxy/config.toml`
//!
//! A missing file is not an error; built-in defaults apply.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;

use crate::error::ConfigError;

const LOCAL_FILENAME: &str = ".editor-proxy.toml";
const GLOBAL_DIR: &str = "editor-proxy";
const GLOBAL_FILENAME: &str = "config.toml";

/// Default per-call tool timeout
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;

/// Find the config file by walking up from the cwd, then the global dir.
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let candidate = current.join(LOCAL_FILENAME);
        if candidate.exists() {
            return Some(candidate);
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    let global = dirs::config_dir()?.join(GLOBAL_DIR).join(GLOBAL_FILENAME);
    global.exists().then_some(global)
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub audit: AuditSection,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub mcp_servers: HashMap<String, ToolServerConfig>,

    /// Where this config was loaded from, if anywhere
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// Listener settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8899
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// How reasoning text is presented to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkMode {
    /// Inside the content stream between fence markers
    Fenced,
    /// Inside the content stream between `<think>` / `</think>` markers
    #[default]
    Marker,
    /// In the dialect's dedicated reasoning field
    Field,
}

/// Bridge behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    #[serde(default)]
    pub think_mode: ThinkMode,
    /// Appended to the last user message as an instruction, e.g. "English"
    #[serde(default)]
    pub output_language: Option<String>,
    /// Code blocks inside tool results longer than this are truncated
    #[serde(default = "default_max_code_block_chars")]
    pub max_code_block_chars: usize,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    /// Pause between the terminal SSE chunk and closing the socket
    #[serde(default = "default_sse_close_grace_ms")]
    pub sse_close_grace_ms: u64,
}

fn default_max_code_block_chars() -> usize {
    4000
}

fn default_max_tool_rounds() -> usize {
    16
}

fn default_sse_close_grace_ms() -> u64 {
    200
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            think_mode: ThinkMode::default(),
            output_language: None,
            max_code_block_chars: default_max_code_block_chars(),
            max_tool_rounds: default_max_tool_rounds(),
            sse_close_grace_ms: default_sse_close_grace_ms(),
        }
    }
}

impl BridgeSection {
    pub fn sse_close_grace(&self) -> Duration {
        Duration::from_millis(self.sse_close_grace_ms)
    }
}

/// Audit log settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditSection {
    /// Directory for daily JSONL audit files; tracing-only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// An upstream OpenAI-compatible provider
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    /// Base URL up to and including the version segment, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub default: bool,
    /// Whether the provider accepts a `tools` array; otherwise a textual catalogue is injected
    #[serde(default = "default_native_tools")]
    pub native_tools: bool,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_native_tools() -> bool {
    true
}

impl ProviderConfig {
    /// API key with `${VAR}` references expanded
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key.as_ref().map(|key| expand(key))
    }

    /// Extra headers with `${VAR}` references expanded
    pub fn resolved_headers(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|(k, v)| (k.clone(), expand(v)))
            .collect()
    }
}

/// A tool server the proxy can call into.
///
/// Local entries spawn `command`; remote entries talk JSON-RPC to `url`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolServerConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Transport resolved from a [`ToolServerConfig`]
#[derive(Debug, Clone, PartialEq)]
pub enum ToolTransport {
    Local {
        command: String,
        args: Vec<String>,
        env: Vec<(String, String)>,
    },
    Remote {
        url: String,
        headers: Vec<(String, String)>,
    },
}

impl ToolServerConfig {
    pub fn transport(&self, name: &str) -> Result<ToolTransport, ConfigError> {
        if let Some(command) = &self.command {
            return Ok(ToolTransport::Local {
                command: expand(command),
                args: self.args.iter().map(|a| expand(a)).collect(),
                env: self
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), expand(v)))
                    .collect(),
            });
        }
        if let Some(url) = &self.url {
            return Ok(ToolTransport::Remote {
                url: expand(url),
                headers: self
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), expand(v)))
                    .collect(),
            });
        }
        Err(ConfigError::IncompleteServer(name.to_string()))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS))
    }
}

fn expand(value: &str) -> String {
    shellexpand::env(value)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

impl ProxyConfig {
    /// Load from an explicit path, or search for one.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => find_config_file(),
        };

        match path {
            Some(path) => {
                tracing::debug!("Loading config from: {}", path.display());
                Self::load_from_path(&path)
            }
            None => {
                tracing::debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Pick the provider for a requested model id.
    pub fn route(&self, model: &str) -> Option<&ProviderConfig> {
        self.providers
            .iter()
            .find(|p| p.models.iter().any(|m| m == model))
            .or_else(|| self.providers.iter().find(|p| p.default))
            .or_else(|| self.providers.first())
    }

    /// All configured model ids with their owning provider, in config order
    pub fn model_ids(&self) -> Vec<(&str, &str)> {
        self.providers
            .iter()
            .flat_map(|p| p.models.iter().map(move |m| (m.as_str(), p.name.as_str())))
            .collect()
    }
}

/// Shared, reloadable view of the active configuration.
///
/// Readers take a cheap snapshot per request; a reload swaps the whole
/// config at once, so one request never sees a mix of old and new values.
#[derive(Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<ProxyConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: ProxyConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Arc<ProxyConfig> {
        self.tx.borrow().clone()
    }

    pub fn replace(&self, config: ProxyConfig) {
        self.tx.send_replace(Arc::new(config));
    }

    /// Re-read the file the current config came from
    pub fn reload(&self) -> Result<Arc<ProxyConfig>, ConfigError> {
        let source = self.current().source.clone();
        let config = ProxyConfig::load(source.as_deref())?;
        self.replace(config);
        Ok(self.current())
    }
}

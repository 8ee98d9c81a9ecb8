//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Top-level Pathfinder configuration, shared by the coordinator and the agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness: Option<LivenessConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignments: Option<AssignmentsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Robot connection auth. Browsers are identified by the identity provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<GatewayAuthConfig>,
}

fn default_port() -> u16 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayAuthConfig {
    /// Auth mode: "none", "token", or "password". Default: "none".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,
}

impl GatewayAuthConfig {
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }

    pub fn resolve_password(&self) -> Option<String> {
        resolve_secret_field(&self.password, &self.password_env)
    }

    pub fn effective_mode(&self) -> &str {
        self.mode.as_deref().unwrap_or("none")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Silence after which a robot without a live connection is offline.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Latest robot firmware version; older robots are flagged `needs_update`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_robot_version: Option<String>,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            latest_robot_version: None,
        }
    }
}

fn default_heartbeat_timeout() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    5
}

/// Robot agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Stable robot id. Generated per process when omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub robot_id: Option<String>,

    #[serde(default = "default_robot_name")]
    pub robot_name: String,

    #[serde(default = "default_robot_version")]
    pub robot_version: String,

    /// Force hardware on or off. Omitted means "use whatever driver is present".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_enabled: Option<bool>,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            robot_id: None,
            robot_name: default_robot_name(),
            robot_version: default_robot_version(),
            hardware_enabled: None,
            heartbeat_interval_secs: default_heartbeat_interval(),
            reconnect_delay_secs: default_reconnect_delay(),
            token: None,
            token_env: None,
        }
    }
}

impl AgentConfig {
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }
}

fn default_server_url() -> String {
    "ws://127.0.0.1:5000".into()
}

fn default_robot_name() -> String {
    "My Robot".into()
}

fn default_robot_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_reconnect_delay() -> u64 {
    5
}

/// Execution sandbox limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// How long `stop` waits for the worker before reporting a timeout.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// VM instructions between forced-cancellation checks.
    #[serde(default = "default_instruction_check_interval")]
    pub instruction_check_interval: u32,

    /// Longer console lines are truncated.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    /// Heap limit for one job's interpreter. 0 disables the limit.
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: default_stop_timeout_ms(),
            instruction_check_interval: default_instruction_check_interval(),
            max_line_bytes: default_max_line_bytes(),
            max_memory_bytes: default_max_memory_bytes(),
        }
    }
}

fn default_stop_timeout_ms() -> u64 {
    2_000
}

fn default_instruction_check_interval() -> u32 {
    1_000
}

fn default_max_line_bytes() -> usize {
    4_096
}

fn default_max_memory_bytes() -> usize {
    64 * 1024 * 1024
}

/// Static identity table used by the built-in identity provider.
///
/// When the section is absent every browser is accepted as the anonymous user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub users: Vec<UserEntry>,

    /// Accept browsers without a token as the anonymous user.
    #[serde(default)]
    pub allow_anonymous: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub token: String,
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub role: crate::types::Role,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignmentsConfig {
    /// JSON file holding persisted user/robot assignments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "pathfinder_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the default config.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        json5::from_str(&substituted)
            .map_err(|e| crate::error::PathfinderError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(5000)
    }

    pub fn bind_addr(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn liveness(&self) -> LivenessConfig {
        self.liveness.clone().unwrap_or_default()
    }

    pub fn agent(&self) -> AgentConfig {
        self.agent.clone().unwrap_or_default()
    }

    pub fn sandbox(&self) -> SandboxConfig {
        self.sandbox.clone().unwrap_or_default()
    }

    /// Path of the persisted assignment table.
    pub fn assignments_path(&self) -> PathBuf {
        self.assignments
            .as_ref()
            .and_then(|a| a.path.as_ref())
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir().join("assignments.json"))
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
            if let Some(auth) = &gw.auth {
                match auth.effective_mode() {
                    "none" => {}
                    "token" if auth.resolve_token().is_none() => {
                        errors.push("Auth mode 'token' but no token configured".to_string())
                    }
                    "password" if auth.resolve_password().is_none() => errors
                        .push("Auth mode 'password' but no password configured".to_string()),
                    "token" | "password" => {}
                    other => errors.push(format!("Unknown auth mode: {other}")),
                }
            }
        }

        let liveness = self.liveness();
        if liveness.heartbeat_timeout_secs == 0 {
            errors.push("liveness.heartbeat_timeout_secs cannot be 0".to_string());
        }
        if liveness.sweep_interval_secs == 0 {
            errors.push("liveness.sweep_interval_secs cannot be 0".to_string());
        }

        let agent = self.agent();
        if agent.heartbeat_interval_secs >= liveness.heartbeat_timeout_secs {
            warnings.push(format!(
                "Agent heartbeat interval ({}s) is not shorter than the liveness timeout ({}s)",
                agent.heartbeat_interval_secs, liveness.heartbeat_timeout_secs
            ));
        }

        let sandbox = self.sandbox();
        if sandbox.instruction_check_interval == 0 {
            errors.push("sandbox.instruction_check_interval cannot be 0".to_string());
        }
        if sandbox.max_memory_bytes == 0 {
            warnings.push("sandbox.max_memory_bytes is 0; scripts may use unbounded memory".to_string());
        }

        if let Some(identity) = &self.identity {
            if identity.users.is_empty() && !identity.allow_anonymous {
                warnings.push(
                    "No identity users configured and anonymous access disabled; browsers cannot connect"
                        .to_string(),
                );
            }
        }

        (warnings, errors)
    }

    /// Robot id for the agent: `agent.robot_id` if set, otherwise the id
    /// stored at `id_path`, generated and stored on first use.
    pub fn resolve_robot_id(&self, id_path: &Path) -> anyhow::Result<String> {
        match self.agent().robot_id {
            Some(id) => Ok(id),
            None => load_or_create_robot_id(id_path),
        }
    }
}

/// Where an agent without a configured `robot_id` keeps its generated one.
pub fn robot_id_path() -> PathBuf {
    data_dir().join("robot_id")
}

/// Read the robot id stored at `path`, or generate one and store it there.
pub fn load_or_create_robot_id(path: &Path) -> anyhow::Result<String> {
    if path.exists() {
        let id = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let id = id.trim();
        if id.is_empty() {
            anyhow::bail!("robot id file {} is empty", path.display());
        }
        return Ok(id.to_string());
    }

    let id = crate::types::generate_robot_id();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{id}\n"))
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(robot_id = %id, path = %path.display(), "Generated robot id");
    Ok(id)
}

/// Base directory for Pathfinder data: `~/.pathfinder/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pathfinder")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_PF_TOKEN", "robot-secret") };
        let input = r#"{"token": "${TEST_PF_TOKEN}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("robot-secret"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_PF_TOKEN") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_PF_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_port(), 5000);
        assert_eq!(config.liveness().heartbeat_timeout_secs, 30);
        assert_eq!(config.agent().heartbeat_interval_secs, 10);
        assert_eq!(config.sandbox().stop_timeout_ms, 2_000);
    }

    #[test]
    fn test_load_json5_with_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // coordinator
                gateway: { port: 6100 },
                liveness: { heartbeat_timeout_secs: 45, latest_robot_version: "1.2.0" },
                agent: { robot_id: "robot_abc", robot_name: "Findee" },
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.gateway_port(), 6100);
        let liveness = config.liveness();
        assert_eq!(liveness.heartbeat_timeout_secs, 45);
        assert_eq!(liveness.sweep_interval_secs, 5);
        assert_eq!(liveness.latest_robot_version.as_deref(), Some("1.2.0"));
        assert_eq!(config.agent().robot_id.as_deref(), Some("robot_abc"));
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = Config::load(Path::new("/nonexistent/pathfinder.json")).unwrap();
        assert!(config.gateway.is_none());
    }

    #[test]
    fn test_validate_token_mode_without_token() {
        let config = Config {
            gateway: Some(GatewayConfig {
                port: 5000,
                bind: None,
                auth: Some(GatewayAuthConfig {
                    mode: Some("token".into()),
                    token: None,
                    token_env: None,
                    password: None,
                    password_env: None,
                }),
            }),
            ..Default::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("no token")));
    }

    #[test]
    fn test_validate_heartbeat_slower_than_timeout() {
        let config = Config {
            agent: Some(AgentConfig {
                heartbeat_interval_secs: 40,
                ..Default::default()
            }),
            ..Default::default()
        };
        let (warnings, errors) = config.validate();
        assert!(errors.is_empty());
        assert!(warnings.iter().any(|w| w.contains("heartbeat interval")));
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_generated_robot_id_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("robot_id");

        let first = Config::default().resolve_robot_id(&path).unwrap();
        assert!(first.starts_with("robot_"));
        let again = Config::default().resolve_robot_id(&path).unwrap();
        assert_eq!(first, again);

        let configured = Config {
            agent: Some(AgentConfig {
                robot_id: Some("robot_fixed".into()),
                ..AgentConfig::default()
            }),
            ..Config::default()
        };
        assert_eq!(configured.resolve_robot_id(&path).unwrap(), "robot_fixed");
    }
}

//! Configuration for the relay
//!
//! Every setting resolves in the same order:
//!
//! 1. `THINKING_RELAY_*` environment variable
//! 2. value set explicitly on the builder
//! 3. built-in default
//!
//! The binary maps its command line flags onto the builder, so flags act as the
//! explicit layer and the environment still wins for deployments that inject it.

use crate::mcp::ToolProcessConfig;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default OpenAI-compatible endpoint (OpenRouter).
pub const DEFAULT_UPSTREAM_URL: &str = "https://openrouter.ai/api/v1";

/// Default command that launches the sequential-thinking tool server.
pub const DEFAULT_TOOL_COMMAND: &str = "npx";

/// Default arguments for [`DEFAULT_TOOL_COMMAND`].
pub const DEFAULT_TOOL_ARGS: &[&str] = &["-y", "@modelcontextprotocol/server-sequential-thinking"];

/// Maximum number of tool round-trips per client request.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Origin of the Angular dev server that hosts the browser client.
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:4200";

const ENV_PREFIX: &str = "THINKING_RELAY_";

/// Runtime configuration of the relay service.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the HTTP server binds to
    pub bind_addr: SocketAddr,

    /// Base URL of the upstream chat API (without `/chat/completions`)
    pub upstream_url: String,

    /// Bound on connecting upstream, on waiting for response headers and on
    /// each silence inside a streamed body
    pub upstream_timeout: Duration,

    /// Executable of the tool process
    pub tool_command: String,

    /// Arguments passed to the tool process
    pub tool_args: Vec<String>,

    /// Bound on the tool process initialization handshake
    pub handshake_timeout: Duration,

    /// Bound on a single tool invocation
    pub invoke_timeout: Duration,

    /// Grace period between the terminate request and the force kill
    pub shutdown_timeout: Duration,

    /// Maximum tool round-trips per client request
    pub max_iterations: u32,

    /// Optional system prompt prepended to every conversation
    pub system_prompt: Option<String>,

    /// Origins allowed by CORS
    pub cors_origins: Vec<String>,

    /// Directory served under `/static`, if any
    pub static_dir: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            upstream_timeout: Duration::from_secs(300),
            tool_command: DEFAULT_TOOL_COMMAND.to_string(),
            tool_args: DEFAULT_TOOL_ARGS.iter().map(|s| s.to_string()).collect(),
            handshake_timeout: Duration::from_secs(30),
            invoke_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            system_prompt: None,
            cors_origins: vec![DEFAULT_CORS_ORIGIN.to_string()],
            static_dir: None,
        }
    }
}

impl RelayConfig {
    /// Create a new builder for RelayConfig
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }

    /// Settings for the tool process manager.
    pub fn tool_process(&self) -> ToolProcessConfig {
        ToolProcessConfig {
            command: self.tool_command.clone(),
            args: self.tool_args.clone(),
            handshake_timeout: self.handshake_timeout,
            invoke_timeout: self.invoke_timeout,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

/// Builder for RelayConfig
#[derive(Debug, Default)]
pub struct RelayConfigBuilder {
    bind_addr: Option<String>,
    upstream_url: Option<String>,
    upstream_timeout: Option<u64>,
    tool_command: Option<String>,
    tool_args: Option<Vec<String>>,
    handshake_timeout: Option<u64>,
    invoke_timeout: Option<u64>,
    shutdown_timeout: Option<u64>,
    max_iterations: Option<u32>,
    system_prompt: Option<String>,
    cors_origins: Option<Vec<String>>,
    static_dir: Option<PathBuf>,
}

impl RelayConfigBuilder {
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = Some(addr.into());
        self
    }

    pub fn upstream_url(mut self, url: impl Into<String>) -> Self {
        self.upstream_url = Some(url.into());
        self
    }

    /// Upstream timeout in seconds
    pub fn upstream_timeout(mut self, secs: u64) -> Self {
        self.upstream_timeout = Some(secs);
        self
    }

    pub fn tool_command(mut self, command: impl Into<String>) -> Self {
        self.tool_command = Some(command.into());
        self
    }

    pub fn tool_args(mut self, args: Vec<String>) -> Self {
        self.tool_args = Some(args);
        self
    }

    /// Handshake timeout in seconds
    pub fn handshake_timeout(mut self, secs: u64) -> Self {
        self.handshake_timeout = Some(secs);
        self
    }

    /// Invocation timeout in seconds
    pub fn invoke_timeout(mut self, secs: u64) -> Self {
        self.invoke_timeout = Some(secs);
        self
    }

    /// Shutdown grace period in seconds
    pub fn shutdown_timeout(mut self, secs: u64) -> Self {
        self.shutdown_timeout = Some(secs);
        self
    }

    pub fn max_iterations(mut self, iterations: u32) -> Self {
        self.max_iterations = Some(iterations);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    pub fn static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_dir = Some(dir.into());
        self
    }

    /// Build using the process environment as the highest-priority layer.
    pub fn build(self) -> Result<RelayConfig> {
        self.build_with(|key| std::env::var(key).ok())
    }

    /// Build using `lookup` as the environment layer.
    ///
    /// `lookup` receives full variable names such as `THINKING_RELAY_BIND_ADDR`.
    pub fn build_with<F>(self, lookup: F) -> Result<RelayConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
        };
        let defaults = RelayConfig::default();

        let bind_addr = match env("BIND_ADDR").or(self.bind_addr) {
            Some(addr) => addr
                .parse()
                .map_err(|e| Error::config(format!("Invalid bind address '{}': {}", addr, e)))?,
            None => defaults.bind_addr,
        };

        let upstream_url = env("UPSTREAM_URL")
            .or(self.upstream_url)
            .unwrap_or(defaults.upstream_url)
            .trim_end_matches('/')
            .to_string();
        if !upstream_url.starts_with("http://") && !upstream_url.starts_with("https://") {
            return Err(Error::config(format!(
                "upstream_url must be an http(s) URL, got '{}'",
                upstream_url
            )));
        }

        let tool_command = env("TOOL_COMMAND")
            .or(self.tool_command)
            .unwrap_or(defaults.tool_command);
        if tool_command.trim().is_empty() {
            return Err(Error::config("tool_command must not be empty"));
        }

        let tool_args = env("TOOL_ARGS")
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .or(self.tool_args)
            .unwrap_or(defaults.tool_args);

        let max_iterations = match env("MAX_ITERATIONS") {
            Some(raw) => parse_number(&raw, "MAX_ITERATIONS")?,
            None => self.max_iterations.unwrap_or(defaults.max_iterations),
        };
        if max_iterations == 0 {
            return Err(Error::config("max_iterations must be at least 1"));
        }

        let seconds = |name: &str, explicit: Option<u64>, default: Duration| -> Result<Duration> {
            match env(name) {
                Some(raw) => Ok(Duration::from_secs(parse_number(&raw, name)?)),
                None => Ok(explicit.map(Duration::from_secs).unwrap_or(default)),
            }
        };

        let cors_origins = env("CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .or(self.cors_origins)
            .unwrap_or(defaults.cors_origins);

        Ok(RelayConfig {
            bind_addr,
            upstream_url,
            upstream_timeout: seconds(
                "UPSTREAM_TIMEOUT",
                self.upstream_timeout,
                defaults.upstream_timeout,
            )?,
            tool_command,
            tool_args,
            handshake_timeout: seconds(
                "HANDSHAKE_TIMEOUT",
                self.handshake_timeout,
                defaults.handshake_timeout,
            )?,
            invoke_timeout: seconds(
                "INVOKE_TIMEOUT",
                self.invoke_timeout,
                defaults.invoke_timeout,
            )?,
            shutdown_timeout: seconds(
                "SHUTDOWN_TIMEOUT",
                self.shutdown_timeout,
                defaults.shutdown_timeout,
            )?,
            max_iterations,
            system_prompt: env("SYSTEM_PROMPT").or(self.system_prompt),
            cors_origins,
            static_dir: env("STATIC_DIR").map(PathBuf::from).or(self.static_dir),
        })
    }
}

fn parse_number<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::config(format!("{}{} must be a number, got '{}'", ENV_PREFIX, name, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults() {
        let config = RelayConfig::builder().build_with(no_env).unwrap();

        assert_eq!(config.bind_addr.port(), 8000);
        assert_eq!(config.upstream_url, DEFAULT_UPSTREAM_URL);
        assert_eq!(config.tool_command, "npx");
        assert_eq!(
            config.tool_args,
            vec!["-y", "@modelcontextprotocol/server-sequential-thinking"]
        );
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.invoke_timeout, Duration::from_secs(60));
        assert_eq!(config.cors_origins, vec!["http://localhost:4200"]);
        assert!(config.system_prompt.is_none());
        assert!(config.static_dir.is_none());
    }

    #[test]
    fn test_builder_values() {
        let config = RelayConfig::builder()
            .bind_addr("127.0.0.1:9000")
            .upstream_url("http://localhost:1234/v1/")
            .tool_command("node")
            .tool_args(vec!["dist/index.js".to_string()])
            .max_iterations(3)
            .invoke_timeout(5)
            .system_prompt("Think step by step")
            .build_with(no_env)
            .unwrap();

        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:9000");
        // Trailing slash is trimmed so URL joining stays predictable
        assert_eq!(config.upstream_url, "http://localhost:1234/v1");
        assert_eq!(config.tool_command, "node");
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.invoke_timeout, Duration::from_secs(5));
        assert_eq!(config.system_prompt.as_deref(), Some("Think step by step"));
    }

    #[test]
    fn test_environment_wins_over_builder() {
        let env: HashMap<&str, &str> = [
            ("THINKING_RELAY_BIND_ADDR", "127.0.0.1:7000"),
            ("THINKING_RELAY_TOOL_ARGS", "-y  some-server --flag"),
            ("THINKING_RELAY_CORS_ORIGINS", "http://a.test, http://b.test,"),
            ("THINKING_RELAY_MAX_ITERATIONS", "4"),
        ]
        .into_iter()
        .collect();

        let config = RelayConfig::builder()
            .bind_addr("127.0.0.1:9000")
            .max_iterations(8)
            .build_with(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.bind_addr.port(), 7000);
        assert_eq!(config.tool_args, vec!["-y", "some-server", "--flag"]);
        assert_eq!(config.cors_origins, vec!["http://a.test", "http://b.test"]);
        assert_eq!(config.max_iterations, 4);
    }

    #[test]
    fn test_blank_environment_value_is_ignored() {
        let config = RelayConfig::builder()
            .tool_command("node")
            .build_with(|key| (key == "THINKING_RELAY_TOOL_COMMAND").then(|| "  ".to_string()))
            .unwrap();
        assert_eq!(config.tool_command, "node");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(
            RelayConfig::builder()
                .bind_addr("not-an-address")
                .build_with(no_env)
                .is_err()
        );
        assert!(
            RelayConfig::builder()
                .upstream_url("ftp://example.com")
                .build_with(no_env)
                .is_err()
        );
        assert!(
            RelayConfig::builder()
                .max_iterations(0)
                .build_with(no_env)
                .is_err()
        );

        let result = RelayConfig::builder().build_with(|key| {
            (key == "THINKING_RELAY_INVOKE_TIMEOUT").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_tool_process_settings() {
        let config = RelayConfig::builder()
            .tool_command("node")
            .handshake_timeout(2)
            .build_with(no_env)
            .unwrap();
        let tool = config.tool_process();

        assert_eq!(tool.command, "node");
        assert_eq!(tool.handshake_timeout, Duration::from_secs(2));
        assert_eq!(tool.invoke_timeout, Duration::from_secs(60));
    }
}

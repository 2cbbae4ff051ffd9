use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};
use janus_client::{JanusResult, ServerList, SessionConfig};
use serde_json::Value;

use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "janus-probe",
    version,
    about = "Open a Janus session, attach a plugin and print what the gateway pushes"
)]
pub struct Cli {
    /// Gateway endpoints (ws://, wss://, http:// or https://), tried in order.
    #[arg(
        long = "server",
        env = "JANUS_SERVER",
        value_delimiter = ',',
        required = true,
        num_args = 1..
    )]
    pub servers: Vec<String>,

    #[arg(long, env = "JANUS_TOKEN")]
    pub token: Option<String>,

    #[arg(long = "api-secret", env = "JANUS_API_SECRET", hide_env_values = true)]
    pub api_secret: Option<String>,

    #[arg(long, default_value = "janus.plugin.echotest")]
    pub plugin: String,

    #[arg(long = "opaque-id")]
    pub opaque_id: Option<String>,

    /// JSON body sent to the plugin right after attaching.
    #[arg(long, value_parser = parse_json)]
    pub message: Option<Value>,

    /// How long to print events before detaching.
    #[arg(long = "listen-secs", default_value_t = 10)]
    pub listen_secs: u64,

    #[arg(long = "keepalive-ms", env = "JANUS_KEEPALIVE_MS")]
    pub keepalive_ms: Option<u64>,

    #[arg(long = "max-poll-events", env = "JANUS_MAX_POLL_EVENTS")]
    pub max_poll_events: Option<u32>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        env = "JANUS_LOG_LEVEL",
        value_enum,
        default_value_t = LogLevel::Warn
    )]
    pub log_level: LogLevel,

    /// Write logs to this file instead of stderr.
    #[arg(long = "log-file", env = "JANUS_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            file: self.log_file.clone(),
        }
    }
}

impl Cli {
    pub fn listen_for(&self) -> Duration {
        Duration::from_secs(self.listen_secs)
    }

    pub fn to_session_config(&self) -> JanusResult<SessionConfig> {
        let servers = match self.servers.as_slice() {
            [single] => ServerList::Single(single.clone()),
            many => ServerList::Multiple(many.to_vec()),
        };
        let mut builder = SessionConfig::builder(servers);
        if let Some(token) = &self.token {
            builder = builder.token(token.clone());
        }
        if let Some(secret) = &self.api_secret {
            builder = builder.apisecret(secret.clone());
        }
        if let Some(millis) = self.keepalive_ms {
            builder = builder.keepalive_period(Duration::from_millis(millis));
        }
        if let Some(maxev) = self.max_poll_events {
            builder = builder.max_poll_events(maxev);
        }
        builder.build()
    }
}

fn parse_json(raw: &str) -> Result<Value, String> {
    let value: Value = serde_json::from_str(raw).map_err(|err| err.to_string())?;
    if !value.is_object() {
        return Err("plugin message must be a JSON object".into());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_separated_servers_become_a_failover_list() {
        let cli = Cli::try_parse_from([
            "janus-probe",
            "--server",
            "ws://a/janus,http://b/janus",
            "--keepalive-ms",
            "5000",
        ])
        .unwrap();
        let config = cli.to_session_config().unwrap();
        assert_eq!(
            config.servers,
            ServerList::Multiple(vec!["ws://a/janus".into(), "http://b/janus".into()])
        );
        assert_eq!(config.keepalive_period, Duration::from_millis(5000));
        assert_eq!(cli.plugin, "janus.plugin.echotest");
        assert_eq!(cli.logging.log_level, LogLevel::Warn);
    }

    #[test]
    fn single_server_keeps_its_own_errors() {
        let cli = Cli::try_parse_from([
            "janus-probe",
            "--server",
            "ws://a/janus",
            "--token",
            "t0k",
            "--max-poll-events",
            "0",
        ])
        .unwrap();
        let config = cli.to_session_config().unwrap();
        assert_eq!(config.servers, ServerList::Single("ws://a/janus".into()));
        assert_eq!(config.token.as_deref(), Some("t0k"));
        assert_eq!(config.max_poll_events, 1);
    }

    #[test]
    fn message_must_be_a_json_object() {
        let ok = Cli::try_parse_from([
            "janus-probe",
            "--server",
            "ws://a/janus",
            "--message",
            r#"{"audio":true}"#,
        ])
        .unwrap();
        assert_eq!(ok.message, Some(serde_json::json!({"audio": true})));

        assert!(Cli::try_parse_from([
            "janus-probe",
            "--server",
            "ws://a/janus",
            "--message",
            "[1,2]",
        ])
        .is_err());
    }

    #[test]
    fn log_flags_map_to_config() {
        let cli = Cli::try_parse_from([
            "janus-probe",
            "--server",
            "ws://a/janus",
            "--log-level",
            "trace",
            "--log-file",
            "/tmp/probe.log",
        ])
        .unwrap();
        let config = cli.logging.to_config();
        assert_eq!(config.level, LogLevel::Trace);
        assert_eq!(config.file, Some(PathBuf::from("/tmp/probe.log")));
    }
}

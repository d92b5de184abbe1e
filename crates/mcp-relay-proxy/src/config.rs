//! CLI surface (§6): one flat `clap::Parser` derive, generalized from a
//! single wrapped subprocess command to the proxy's full
//! `--port`/`--server`/`--dynamic-proxy`/`--enable-proxy` flag set plus a
//! remote-HTTP upstream alternative to `--command`.

use clap::Parser;
use mcp_relay_core::transport::TransportConfig;

/// mcp-relay — a multi-transport proxy for the Model Context Protocol.
///
/// Fronts one upstream MCP server (a subprocess or a remote streamable-HTTP
/// endpoint) with an SSE and/or streamable-HTTP server transport, managing
/// session/connection lifecycle so multiple downstream clients can share or
/// independently drive the upstream.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-relay")]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Port the HTTP front end listens on.
    #[arg(long, env = "MCP_RELAY_PORT", default_value = "3000")]
    pub port: u16,

    /// Path the SSE server transport is mounted at.
    #[arg(long, default_value = "/sse")]
    pub sse_endpoint: String,

    /// Path the StreamableHTTP server transport is mounted at.
    #[arg(long, default_value = "/mcp")]
    pub stream_endpoint: String,

    /// Which server transport(s) to expose.
    #[arg(long, value_enum, default_value = "both")]
    pub server: ServerMode,

    /// Pick the upstream per session from its first `initialize` instead of
    /// always using the statically configured one.
    #[arg(long)]
    pub dynamic_proxy: bool,

    /// Enable the `?target=<url>` opaque HTTP passthrough.
    #[arg(long)]
    pub enable_proxy: bool,

    /// Subprocess command to run as the upstream MCP server. Mutually
    /// exclusive with `--upstream-url`.
    #[arg(long, conflicts_with = "upstream_url")]
    pub command: Option<String>,

    /// Arguments passed to `--command`.
    #[arg(long, allow_hyphen_values = true, num_args = 0..)]
    pub args: Vec<String>,

    /// Shell to wrap `--command` in (e.g. `sh`), instead of executing it
    /// directly.
    #[arg(long)]
    pub shell: Option<String>,

    /// Remote streamable-HTTP upstream URL. Mutually exclusive with
    /// `--command`.
    #[arg(long)]
    pub upstream_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ServerMode {
    Sse,
    Stream,
    Both,
}

impl ServerMode {
    pub fn wants_sse(self) -> bool {
        matches!(self, ServerMode::Sse | ServerMode::Both)
    }

    pub fn wants_stream(self) -> bool {
        matches!(self, ServerMode::Stream | ServerMode::Both)
    }
}

impl Config {
    /// Build the upstream transport config from the mutually exclusive
    /// `--command`/`--upstream-url` flags. `clap`'s `conflicts_with` already
    /// rules out both being set; this also covers neither being set, which
    /// clap alone can't express cleanly for an otherwise-optional pair.
    pub fn upstream(&self) -> Result<TransportConfig, String> {
        match (&self.command, &self.upstream_url) {
            (Some(command), None) => Ok(TransportConfig::Subprocess {
                command: command.clone(),
                args: self.args.clone(),
                shell: self.shell.clone(),
            }),
            (None, Some(server_url)) => Ok(TransportConfig::RemoteStreamableHttp {
                server_url: server_url.clone(),
            }),
            (None, None) => Err("one of --command or --upstream-url is required".to_string()),
            (Some(_), Some(_)) => unreachable!("clap enforces --command/--upstream-url conflict"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_mode_selection() {
        assert!(ServerMode::Both.wants_sse());
        assert!(ServerMode::Both.wants_stream());
        assert!(ServerMode::Sse.wants_sse());
        assert!(!ServerMode::Sse.wants_stream());
        assert!(!ServerMode::Stream.wants_sse());
    }

    #[test]
    fn upstream_requires_one_of_command_or_url() {
        let config = Config::parse_from(["mcp-relay"]);
        assert!(config.upstream().is_err());
    }

    #[test]
    fn upstream_from_command() {
        let config = Config::parse_from(["mcp-relay", "--command", "npx", "--args", "-y", "server"]);
        match config.upstream().unwrap() {
            TransportConfig::Subprocess { command, args, .. } => {
                assert_eq!(command, "npx");
                assert_eq!(args, vec!["-y", "server"]);
            }
            _ => panic!("expected subprocess"),
        }
    }
}

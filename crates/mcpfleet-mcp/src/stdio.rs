//! Standard-stream pipe transport
//!
//! Client instances spawn the target command as a child process and talk to
//! it over its stdin/stdout. Server instances serve on this process's own
//! stdin/stdout.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use mcpfleet_core::{Channel, OpenRequest, Transport, TransportError, TransportKind};
use rmcp::transport::{stdio, ConfigureCommandExt, TokioChildProcess};
use rmcp::ServiceExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::channel::{HostedChannel, RmcpClientChannel};
use crate::handler::{FleetClientHandler, FleetServerHandler};

/// Split a command line into executable and arguments.
///
/// Accepts formats copied from desktop client configs:
/// - "docker run -i --rm image" → ("docker", ["run", "-i", "--rm", "image"])
/// - "npx -y @some/server" → ("npx", ["-y", "@some/server"])
/// - "node" with args ["server.js"] → ("node", ["server.js"])
pub fn parse_command(command: &str, args: &[String]) -> Result<(String, Vec<String>)> {
    if !args.is_empty() {
        return Ok((command.trim().to_string(), args.to_vec()));
    }

    let mut parts = shell_words::split(command)
        .context("Failed to parse command string - check for unmatched quotes")?
        .into_iter();

    let executable = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty command after parsing"))?;
    Ok((executable, parts.collect()))
}

/// Connect flavour: child process
#[derive(Debug, Default)]
pub struct StdioConnector;

#[async_trait]
impl Transport for StdioConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn open(&self, request: &OpenRequest) -> Result<Arc<dyn Channel>, TransportError> {
        let (executable, args) = parse_command(&request.target, &request.options.args).map_err(
            |e| TransportError::InvalidTarget {
                target: request.target.clone(),
                reason: format!("{:#}", e),
            },
        )?;

        let command_path = which::which(&executable)
            .or_else(|_| which::which(format!("{}.exe", &executable)))
            .map_err(|_| {
                let reason = "command not found, ensure it is installed and in PATH".to_string();
                error!(instance = %request.instance, executable = %executable, "{}", reason);
                TransportError::Spawn {
                    command: executable.clone(),
                    reason,
                }
            })?;

        info!(
            instance = %request.instance,
            path = ?command_path,
            args = ?args,
            "Spawning stdio MCP server"
        );

        let env = request.options.env.clone();
        let child_args = args.clone();
        let transport = TokioChildProcess::new(Command::new(&command_path).configure(move |cmd| {
            cmd.args(&child_args)
                .envs(&env)
                .stderr(Stdio::null())
                .kill_on_drop(true);

            // Keep terminal signals sent to us away from the child.
            #[cfg(unix)]
            {
                cmd.process_group(0);
            }
        }))
        .map_err(|e| TransportError::Spawn {
            command: executable.clone(),
            reason: e.to_string(),
        })?;

        let client = FleetClientHandler::new(request)
            .serve(transport)
            .await
            .map_err(|e| TransportError::Handshake {
                target: request.target.clone(),
                reason: e.to_string(),
            })?;

        info!(instance = %request.instance, "Stdio MCP server connected");
        Ok(Arc::new(RmcpClientChannel::new(
            client,
            format!("stdio:{}", executable),
        )))
    }
}

/// Host flavour: serve on our own stdin/stdout
#[derive(Debug, Default)]
pub struct StdioHost;

#[async_trait]
impl Transport for StdioHost {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn open(&self, request: &OpenRequest) -> Result<Arc<dyn Channel>, TransportError> {
        let handler = FleetServerHandler::new(request);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let instance = request.instance.clone();

        // The handshake only completes once a client writes to stdin, so the
        // whole session runs in the background.
        let task = tokio::spawn(async move {
            let session = tokio::select! {
                _ = token.cancelled() => return,
                result = handler.serve_with_ct(stdio(), token.child_token()) => result,
            };
            match session {
                Ok(running) => {
                    debug!(instance = %instance, "Stdio host session initialized");
                    let reason = running.waiting().await;
                    info!(instance = %instance, reason = ?reason, "Stdio host session ended");
                }
                Err(e) => error!(instance = %instance, error = %e, "Stdio host handshake failed"),
            }
        });

        info!(instance = %request.instance, "Serving MCP on stdio");
        Ok(Arc::new(HostedChannel::new(
            format!("stdio-host:{}", request.instance),
            shutdown,
            task,
        )))
    }
}

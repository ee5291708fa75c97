/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Control Channel: a line-oriented administrative protocol
//! over a Unix- or TCP-domain socket. Verbs: `SHOW-COUNTER`,
//! `RESET-COUNTER`, `RELOAD`, `SHUTDOWN`, `GRACEFUL`, `QUIT`. Responses
//! are `NNN TEXT` lines, matching the dispatch table and reply wording
//! the control channel this crate's lineage uses.
//!
//! [`dispatch`] is the pure, transport-agnostic command handler; the
//! listener loop around it is a thin `tokio::net` adapter so the dispatch
//! logic itself can be unit tested without binding a socket.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tracing::{error, info, warn};

use crate::context::ContextManager;
use crate::counter::ConnectionCounter;
use crate::stats::{self, Statistics};

/// What the accept loop should do after a command completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Keep the connection open for further commands.
    KeepOpen,
    /// Close this connection only (`QUIT`).
    CloseConnection,
    /// Stop the milter listener immediately and shut down.
    Shutdown,
    /// Stop the milter listener but let in-flight sessions drain.
    Graceful,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatsFormat {
    Plain,
    Json,
}

fn parse_url_format(param: &str) -> StatsFormat {
    let trimmed = param.trim().trim_start_matches('/').trim_end_matches('/');
    match trimmed.to_ascii_lowercase().as_str() {
        "json" => StatsFormat::Json,
        _ => StatsFormat::Plain,
    }
}

fn render_row(mech: &str, counts: &[u64], names: impl Fn(usize) -> &'static str, out: &mut String) {
    use std::fmt::Write as _;
    for (i, c) in counts.iter().enumerate() {
        let _ = writeln!(out, "{mech}-{}: {c}", names(i));
    }
}

fn row_to_json(counts: &[u64], names: impl Fn(usize) -> &'static str) -> serde_json::Value {
    let mut row = serde_json::Map::with_capacity(counts.len());
    for (i, c) in counts.iter().enumerate() {
        row.insert(names(i).to_string(), serde_json::Value::from(*c));
    }
    serde_json::Value::Object(row)
}

fn render_statistics(spf: [u64; 7], sender_id: [u64; 7], dkim: [u64; 7], adsp: [u64; 7], atps: [u64; 3], dmarc: [u64; 7], format: StatsFormat) -> String {
    if format == StatsFormat::Json {
        let mut table = serde_json::Map::new();
        table.insert("spf".to_string(), row_to_json(&spf, stats::score_name));
        table.insert("sidf".to_string(), row_to_json(&sender_id, stats::score_name));
        table.insert("dkim".to_string(), row_to_json(&dkim, stats::score_name));
        table.insert("dkim-adsp".to_string(), row_to_json(&adsp, stats::adsp_score_name));
        table.insert("dkim-atps".to_string(), row_to_json(&atps, stats::atps_score_name));
        table.insert("dmarc".to_string(), row_to_json(&dmarc, stats::score_name));
        return serde_json::to_string_pretty(&serde_json::Value::Object(table))
            .unwrap_or_else(|_| "{}".to_string())
            + "\n";
    }

    let mut out = String::new();
    render_row("spf", &spf, stats::score_name, &mut out);
    render_row("sidf", &sender_id, stats::score_name, &mut out);
    render_row("dkim", &dkim, stats::score_name, &mut out);
    render_row("dkim-adsp", &adsp, stats::adsp_score_name, &mut out);
    render_row("dkim-atps", &atps, stats::atps_score_name, &mut out);
    render_row("dmarc", &dmarc, stats::score_name, &mut out);
    out
}

fn show_counter(stats: &Statistics, param: &str) -> String {
    let format = parse_url_format(param);
    render_statistics(
        stats.spf.snapshot(),
        stats.sender_id.snapshot(),
        stats.dkim.snapshot(),
        stats.dkim_adsp.snapshot(),
        stats.dkim_atps.snapshot(),
        stats.dmarc.snapshot(),
        format,
    )
}

fn reset_counter(stats: &Statistics, param: &str) -> String {
    let format = parse_url_format(param);
    render_statistics(
        stats.spf.take(),
        stats.sender_id.take(),
        stats.dkim.take(),
        stats.dkim_adsp.take(),
        stats.dkim_atps.take(),
        stats.dmarc.take(),
        format,
    )
}

fn split_command(line: &str) -> (String, String) {
    let line = line.trim();
    match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb.to_ascii_uppercase(), rest.trim().to_string()),
        None => (line.to_ascii_uppercase(), String::new()),
    }
}

/// Dispatch one command line against the shared context/stats handles.
/// Returns the full response text (without trailing newline; caller
/// writes it followed by `\n`) and what the accept loop should do next.
pub async fn dispatch(line: &str, ctx: &ContextManager, stats: &Arc<Statistics>) -> (String, ControlOutcome) {
    let (verb, param) = split_command(line);
    match verb.as_str() {
        "SHOW-COUNTER" => (show_counter(stats, &param), ControlOutcome::KeepOpen),
        "RESET-COUNTER" => (reset_counter(stats, &param), ControlOutcome::KeepOpen),
        "RELOAD" => {
            info!("reloading configuration");
            let result = ctx
                .reload(|old| {
                    let cfg = crate::config::Config::load(&old.config_file)?;
                    let exclusion = cfg.ip_exclusion.clone();
                    crate::context::AuthContext::build(&cfg, old.stats.clone(), &exclusion)
                })
                .await;
            match result {
                Ok(()) => {
                    info!("reconfiguration succeeded");
                    ("200 RELOADED".to_string(), ControlOutcome::KeepOpen)
                }
                Err(e) => {
                    warn!(error = %e, "reconfiguration aborted");
                    ("500 FAILED".to_string(), ControlOutcome::KeepOpen)
                }
            }
        }
        "SHUTDOWN" => ("200 SHUTDOWN ACCEPTED".to_string(), ControlOutcome::Shutdown),
        "GRACEFUL" => ("200 GRACEFUL SHUTDOWN ACCEPTED".to_string(), ControlOutcome::Graceful),
        "QUIT" => ("200 OK".to_string(), ControlOutcome::CloseConnection),
        other => (format!("500 UNKNOWN COMMAND: {other}"), ControlOutcome::KeepOpen),
    }
}

/// Handle one accepted control connection: read lines, dispatch, write
/// responses, until the peer disconnects or a terminal verb fires.
async fn handle_connection<S>(stream: S, ctx: Arc<ContextManager>, stats: Arc<Statistics>, shutdown: Arc<tokio::sync::Notify>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "control connection read error");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let (response, outcome) = dispatch(&line, &ctx, &stats).await;
        if writer.write_all(format!("{response}\n").as_bytes()).await.is_err() {
            return;
        }
        let _ = writer.flush().await;

        match outcome {
            ControlOutcome::KeepOpen => continue,
            ControlOutcome::CloseConnection => return,
            ControlOutcome::Shutdown | ControlOutcome::Graceful => {
                shutdown.notify_waiters();
                return;
            }
        }
    }
}

/// Parsed `control_socket` config value: `unix:/path/to/sock` or
/// `inet:PORT@HOST` (mirrors the milter_socket convention).
enum Bind {
    Unix(String),
    Tcp(String),
}

fn parse_bind(spec: &str) -> Bind {
    if let Some(path) = spec.strip_prefix("unix:") {
        return Bind::Unix(path.to_string());
    }
    if let Some(rest) = spec.strip_prefix("inet:") {
        if let Some((port, host)) = rest.split_once('@') {
            return Bind::Tcp(format!("{host}:{port}"));
        }
        return Bind::Tcp(format!("127.0.0.1:{rest}"));
    }
    Bind::Tcp(spec.to_string())
}

/// Run the control-channel accept loop until `shutdown` fires. The
/// listener itself holds no reference on [`ConnectionCounter`] — the
/// milter listener is what that counter tracks.
pub async fn run(
    socket_spec: &str,
    ctx: Arc<ContextManager>,
    stats: Arc<Statistics>,
    shutdown: Arc<tokio::sync::Notify>,
    _conn_counter: Arc<ConnectionCounter>,
) -> crate::error::Result<()> {
    use crate::error::Status;

    match parse_bind(socket_spec) {
        Bind::Tcp(addr) => {
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|e| Status::System(format!("control channel bind {addr} failed: {e}")))?;
            info!(%addr, "control channel listening");
            loop {
                tokio::select! {
                    _ = shutdown.notified() => return Ok(()),
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { continue };
                        info!(%peer, "control connection accepted");
                        let ctx = ctx.clone();
                        let stats = stats.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move { handle_connection(stream, ctx, stats, shutdown).await });
                    }
                }
            }
        }
        Bind::Unix(path) => {
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path)
                .map_err(|e| Status::System(format!("control channel bind {path} failed: {e}")))?;
            info!(%path, "control channel listening");
            loop {
                tokio::select! {
                    _ = shutdown.notified() => return Ok(()),
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        info!("control connection accepted");
                        let ctx = ctx.clone();
                        let stats = stats.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move { handle_connection(stream, ctx, stats, shutdown).await });
                    }
                }
            }
        }
    }
}

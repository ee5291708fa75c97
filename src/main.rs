/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Binary entry point: loads configuration, builds the shared context and
//! statistics tables, starts the control channel, and runs the milter
//! listener, dispatching every callback into a [`Session`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use indymilter::{Actions, Callbacks, Config as MilterConfig, ProtocolSteps, SessionConfig, Status as MilterStatus};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use milter_authd::config::Config;
use milter_authd::context::{AuthContext, ContextManager};
use milter_authd::counter::ConnectionCounter;
use milter_authd::session::{ConnectAction, Negotiation, Session, Verdict};
use milter_authd::stats::Statistics;
use milter_authd::{control, session};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "milter-authd", about = "SPF/DKIM/DMARC authentication milter")]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/milter-authd/milter-authd.conf")]
    config: String,

    /// Exit after successfully parsing the configuration, without binding
    /// any sockets.
    #[arg(short = 't', long)]
    test_config: bool,
}

fn main() -> milter_authd::error::Result<()> {
    let args = Args::parse();
    let cfg = Config::load(&args.config)?;

    init_tracing(cfg.log_level.as_tracing_filter());
    milter_authd::digest::init();

    if args.test_config {
        println!("{}: configuration OK", args.config);
        return Ok(());
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| milter_authd::error::Status::System(format!("failed to start async runtime: {e}")))?
        .block_on(run(cfg))
}

fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

async fn run(cfg: Config) -> milter_authd::error::Result<()> {
    let stats = Arc::new(Statistics::new());
    let auth_ctx = AuthContext::build(&cfg, stats.clone(), &cfg.ip_exclusion)?;
    let ctx_manager = Arc::new(ContextManager::new(auth_ctx, cfg.context_lock_timeout));
    let conn_counter = Arc::new(ConnectionCounter::new());
    let shutdown = Arc::new(Notify::new());

    info!(authserv_id = %ctx_manager.current().authserv_id, "starting milter-authd");

    let control_shutdown = shutdown.clone();
    let control_socket = cfg.control_socket.clone();
    let control_ctx = ctx_manager.clone();
    let control_stats = stats.clone();
    let control_conn_counter = conn_counter.clone();
    let control_handle = tokio::spawn(async move {
        control::run(&control_socket, control_ctx, control_stats, control_shutdown, control_conn_counter).await
    });
    let _ = &control_handle;

    run_milter_listener(&cfg.milter_socket, ctx_manager.clone(), conn_counter.clone(), shutdown.clone()).await?;

    info!("waiting for in-flight sessions to drain");
    conn_counter.decrement(); // release the listener's own reference
    if !conn_counter.wait_for_zero(cfg.graceful_shutdown_timeout).await {
        warn!("graceful shutdown timed out with sessions still open");
    }

    Ok(())
}

/// Milter-side session data: one [`Session`] per accepted connection,
/// guarded by a mutex since indymilter invokes callbacks against a shared
/// context handle (the state machine itself stays synchronous apart from
/// `EOM`, so contention here is negligible).
type SessionData = Mutex<Session>;

fn build_callbacks(ctx: Arc<ContextManager>, conn_counter: Arc<ConnectionCounter>) -> Callbacks<SessionData> {
    Callbacks::new()
        .on_negotiate({
            move |_session, _actions, _steps| {
                Box::pin(async move {
                    let Negotiation { .. } = session::negotiate();
                    (MilterStatus::Continue, Actions::ADD_HEADERS, ProtocolSteps::empty())
                })
            }
        })
        .on_connect({
            let ctx = ctx.clone();
            let conn_counter = conn_counter.clone();
            move |session, _hostname, addr: Option<SocketAddr>| {
                let ctx = ctx.clone();
                let conn_counter = conn_counter.clone();
                Box::pin(async move {
                    let mut inner = Session::new(ctx.current(), conn_counter);
                    let action = inner.connect(addr.map(|a| a.ip()));
                    session.data = Some(Mutex::new(inner));
                    match action {
                        ConnectAction::Proceed => MilterStatus::Continue,
                        ConnectAction::SkipExcluded => MilterStatus::Accept,
                    }
                })
            }
        })
        .on_helo({
            move |session, helo: String| {
                Box::pin(async move {
                    if let Some(data) = &session.data {
                        data.lock().await.helo(&helo);
                    }
                    MilterStatus::Continue
                })
            }
        })
        .on_mail({
            move |session, args: Vec<String>| {
                Box::pin(async move {
                    if let Some(data) = &session.data {
                        data.lock().await.envfrom(&args);
                    }
                    MilterStatus::Continue
                })
            }
        })
        .on_header({
            move |session, name: String, value: String| {
                Box::pin(async move {
                    if let Some(data) = &session.data {
                        data.lock().await.header(&name, &value);
                    }
                    MilterStatus::Continue
                })
            }
        })
        .on_eoh({
            move |session| {
                Box::pin(async move {
                    if let Some(data) = &session.data {
                        if let Err(e) = data.lock().await.eoh() {
                            error!(error = %e, "eoh processing failed");
                            return MilterStatus::Tempfail;
                        }
                    }
                    MilterStatus::Continue
                })
            }
        })
        .on_body({
            move |session, chunk: Vec<u8>| {
                Box::pin(async move {
                    if let Some(data) = &session.data {
                        if let Err(e) = data.lock().await.body(&chunk) {
                            error!(error = %e, "body processing failed");
                            return MilterStatus::Tempfail;
                        }
                    }
                    MilterStatus::Continue
                })
            }
        })
        .on_eom({
            move |session| {
                Box::pin(async move {
                    let Some(data) = &session.data else {
                        return MilterStatus::Continue;
                    };
                    let outcome = match data.lock().await.eom().await {
                        Ok(o) => o,
                        Err(e) => {
                            error!(error = %e, "eom processing failed");
                            return MilterStatus::Tempfail;
                        }
                    };

                    // Highest occurrence ordinal first: deleting a lower
                    // one first would shift the ordinals of any remaining
                    // same-named header down by one underneath us.
                    let mut ordinals = outcome.remove_forged_ar.clone();
                    ordinals.sort_unstable_by(|a, b| b.cmp(a));
                    for ordinal in ordinals {
                        let _ = session.actions.change_header(outcome.header_name, ordinal, "").await;
                    }
                    // Index 1 is the topmost header in indymilter's
                    // `insert_header`, mirroring libmilter's smfi_insheader
                    // convention; `add_header` would append at the bottom.
                    let _ = session.actions.insert_header(1, outcome.header_name, &outcome.header_value).await;

                    match outcome.verdict {
                        Verdict::Continue => MilterStatus::Continue,
                        Verdict::Reject { code } => {
                            let _ = session.actions.setreply(&code, None, None).await;
                            MilterStatus::Reject
                        }
                        Verdict::TempFail { code } => {
                            let _ = session.actions.setreply(&code, None, None).await;
                            MilterStatus::Tempfail
                        }
                        Verdict::Discard => MilterStatus::Discard,
                    }
                })
            }
        })
        .on_abort({
            move |session| {
                Box::pin(async move {
                    if let Some(data) = &session.data {
                        data.lock().await.abort();
                    }
                    MilterStatus::Continue
                })
            }
        })
        .on_close({
            move |session| {
                Box::pin(async move {
                    if let Some(data) = session.data.take() {
                        data.lock().await.close();
                    }
                    MilterStatus::Continue
                })
            }
        })
}

/// `milter_socket` follows the same `unix:PATH` / `inet:PORT@HOST`
/// convention the control channel uses.
async fn run_milter_listener(
    spec: &str,
    ctx: Arc<ContextManager>,
    conn_counter: Arc<ConnectionCounter>,
    shutdown: Arc<Notify>,
) -> milter_authd::error::Result<()> {
    use milter_authd::error::Status;

    let callbacks = build_callbacks(ctx, conn_counter);
    let milter_cfg = MilterConfig { session: SessionConfig::default(), ..Default::default() };

    if let Some(path) = spec.strip_prefix("unix:") {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .map_err(|e| Status::System(format!("milter socket bind {path} failed: {e}")))?;
        info!(%path, "milter listening");
        indymilter::run(listener, milter_cfg, callbacks, shutdown.notified())
            .await
            .map_err(|e| Status::System(format!("milter listener error: {e}")))
    } else {
        let addr = spec.strip_prefix("inet:").unwrap_or(spec);
        let addr = match addr.split_once('@') {
            Some((port, host)) => format!("{host}:{port}"),
            None => format!("127.0.0.1:{addr}"),
        };
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Status::System(format!("milter socket bind {addr} failed: {e}")))?;
        info!(%addr, "milter listening");
        indymilter::run(listener, milter_cfg, callbacks, shutdown.notified())
            .await
            .map_err(|e| Status::System(format!("milter listener error: {e}")))
    }
}

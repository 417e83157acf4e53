//! Startup wiring and process lifecycle.
//!
//! [`run`] assembles the pool, executor, metrics and web front from
//! [`Settings`], then parks in the signal loop. First INT/TERM starts a
//! graceful shutdown (stop accepting, drain the pool, drop the pidfile); a
//! second one terminates immediately. USR2 hands the listening sockets to
//! a freshly exec'd replacement process and drains this one.

use std::io::Write;
use std::os::fd::RawFd;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};

use outpost_metrics::Registry;
use outpost_net::IpRouter;
use outpost_pool::Pool;

use crate::config::Settings;
use crate::error::ServerError;
use crate::executor::HttpExecutor;
use crate::graceful;
use crate::http_server::WebServer;

/// Builds and runs the proxy until a shutdown signal. Errors here are
/// startup errors; the binary maps them to a non-zero exit code.
pub async fn run(settings: Settings) -> Result<(), ServerError> {
    let router = Arc::new(IpRouter::new(&settings.ip_routes)?);
    if !router.is_empty() {
        tracing::info!("using routes: {router}");
    }

    if let Some(pidfile) = &settings.pidfile {
        match write_pidfile(pidfile) {
            Ok(()) => tracing::info!("pidfile: {}", pidfile.display()),
            Err(err) => {
                tracing::error!("failed to write pidfile {}: {err}", pidfile.display())
            }
        }
    }

    let registry = Arc::new(Registry::new());
    let mut pool = Pool::new(settings.pool_size, settings.pool_queue_size);
    let executor = HttpExecutor::new(router, &registry, settings.log4xx_responses);
    executor.register(&mut pool);
    pool.start();
    executor.spawn_metric_sweepers();
    let pool = Arc::new(pool);

    {
        let pool = pool.clone();
        registry.gauge("queue_size", move || pool.queue_len() as f64);
    }
    {
        let pool = pool.clone();
        registry.gauge("busy_workers", move || pool.active_workers() as f64);
    }

    let server = WebServer::new(pool.clone(), registry.clone());
    let listeners = graceful::bind_all(&settings.listen_addrs()).await?;
    let listener_fds: Vec<RawFd> = listeners.iter().map(|l| l.raw_fd()).collect();
    for listener in listeners {
        server.serve(listener);
    }

    wait_for_signals(server, pool, settings, listener_fds).await
}

async fn wait_for_signals(
    server: WebServer,
    pool: Arc<Pool>,
    settings: Settings,
    listener_fds: Vec<RawFd>,
) -> Result<(), ServerError> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut reload = signal(SignalKind::user_defined2())?;
    let mut shutting_down = false;

    loop {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
            _ = reload.recv() => {
                if shutting_down {
                    continue;
                }
                tracing::info!("graceful restart requested");
                match graceful::respawn(&listener_fds) {
                    Ok(pid) => {
                        tracing::info!("replacement process started with pid {pid}");
                        server.shutdown();
                        pool.shutdown().await;
                        tracing::info!("old process drained, exiting");
                        return Ok(());
                    }
                    Err(err) => tracing::error!("could not start new process: {err}"),
                }
                continue;
            }
        }

        if shutting_down {
            tracing::warn!("forced shutdown");
            return Ok(());
        }
        shutting_down = true;
        server.shutdown();
        let pool = pool.clone();
        let pidfile = settings.pidfile.clone();
        tokio::spawn(async move {
            pool.shutdown().await;
            if let Some(pidfile) = pidfile {
                let _ = std::fs::remove_file(pidfile);
            }
            tracing::info!("bye");
            std::process::exit(0);
        });
    }
}

fn write_pidfile(path: &Path) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(dir)?;
        }
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o664)
        .open(path)?;
    file.write_all(std::process::id().to_string().as_bytes())
}

//! outpost entry point.
//!
//! Clients POST JSON job descriptions and outpost performs the outbound
//! HTTP requests asynchronously from a bounded worker pool.
//!
//! ## Usage
//!
//! ```bash
//! # defaults: 50 workers, queue of 10000, listening on 127.0.0.1:7012
//! outpost
//!
//! # custom pool and an extra unix socket listener
//! outpost --listen "127.0.0.1:7012,/run/outpost.sock" --pool-size 200
//!
//! # steer egress traffic per destination network
//! outpost --ip-routes "172.16.0.0/12 -> 172.16.1.1, 0.0.0.0/0 -> auto"
//!
//! # same schema from an ini-style file; flags override the file
//! outpost --config /etc/outpost.conf
//! ```

use argh::FromArgs;
use anyhow::{Context, Result};

use outpost_server::Settings;

/// fire-and-forget HTTP egress proxy with a bounded worker pool
#[derive(FromArgs)]
struct Args {
    /// comma-separated bind addresses; entries starting with '/' are unix
    /// socket paths (default 127.0.0.1:7012)
    #[argh(option)]
    listen: Option<String>,

    /// number of workers (default 50)
    #[argh(option, long = "pool-size")]
    pool_size: Option<usize>,

    /// max number of queued jobs (default 10000)
    #[argh(option, long = "pool-queue-size")]
    pool_queue_size: Option<usize>,

    /// source ip routing, e.g. '172.16.0.0/12 -> 172.16.1.1, 0.0.0.0/0 -> auto'
    #[argh(option, long = "ip-routes")]
    ip_routes: Option<String>,

    /// log outbound responses with status code >= 400
    #[argh(switch, long = "log4xx-responses")]
    log4xx_responses: bool,

    /// path to pid file
    #[argh(option)]
    pidfile: Option<String>,

    /// path to an ini-style config file using the same keys as the flags
    #[argh(option)]
    config: Option<String>,
}

impl Args {
    fn into_settings(self) -> Result<Settings> {
        let mut settings = Settings::default();
        if let Some(path) = &self.config {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {path}"))?;
            settings
                .apply_file(&text)
                .with_context(|| format!("failed to parse config file {path}"))?;
        }
        if let Some(listen) = self.listen {
            settings.listen = listen;
        }
        if let Some(pool_size) = self.pool_size {
            settings.pool_size = pool_size;
        }
        if let Some(pool_queue_size) = self.pool_queue_size {
            settings.pool_queue_size = pool_queue_size;
        }
        if let Some(ip_routes) = self.ip_routes {
            settings.ip_routes = ip_routes;
        }
        if self.log4xx_responses {
            settings.log4xx_responses = true;
        }
        if let Some(pidfile) = self.pidfile {
            settings.pidfile = Some(pidfile.into());
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = argh::from_env();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let settings = args.into_settings()?;
    tracing::info!(
        "starting outpost with {} workers, queue of {}",
        settings.pool_size,
        settings.pool_queue_size
    );
    outpost_server::run(settings).await?;
    Ok(())
}

pub mod acceptor;
pub mod args;
pub mod auth;
pub mod dns;
pub mod dns_cache;
pub mod endpoint;
pub mod error;
pub mod inspect;
pub mod policy;
pub mod session;
pub mod socks;
pub mod stats;
pub mod tls;
pub mod traflog;

pub use args::{ArgVerbosity, Args};
pub use error::{BoxError, Error, Result};

use crate::acceptor::{DstResolver, FixedDst, MasterProxy, MitmMasterProxy, MitmUdpProxy, ProxyOptions};
use crate::auth::AuthTable;
use crate::dns_cache::ResponseCache;
use crate::policy::{AllowAll, PolicyEvaluator};
use crate::socks::MitmSocksProxy;
use crate::tls::TlsContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const AUTH_SWEEP_INTERVAL_SECS: u64 = 60;

fn default_resolver() -> Result<Arc<dyn DstResolver>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(acceptor::OriginalDst))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err("--fixed-target is required on platforms without SO_ORIGINAL_DST".into())
    }
}

/// Builds the shared state and runs every configured acceptor until the
/// shutdown token fires.
pub async fn main_entry(args: Args, shutdown_token: CancellationToken) -> Result<()> {
    let auth = Arc::new(AuthTable::new(Duration::from_secs(args.auth_idle_timeout)));
    let dns_cache = Arc::new(ResponseCache::new("DNS cache - global", args.dns_cache_size, true));
    let policy: Arc<dyn PolicyEvaluator> = Arc::new(AllowAll);

    let opts = ProxyOptions {
        write_payload: args.write_payload,
        payload_dir: args.payload_dir.clone(),
        payload_prefix: args.payload_prefix.clone(),
        payload_suffix: args.payload_suffix.clone(),
        tcp_timeout_secs: args.tcp_timeout,
        udp_timeout_secs: args.udp_timeout,
        connect_timeout_secs: 10,
        max_sessions: args.max_sessions,
    };

    let tls = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => Some(Arc::new(TlsContext::from_pem_files(cert, key)?)),
        _ => None,
    };

    let mut masters: Vec<Box<dyn MasterProxy>> = Vec::new();

    if let Some(listen) = args.listen {
        let resolver: Arc<dyn DstResolver> = match args.fixed_target {
            Some(target) => Arc::new(FixedDst(target)),
            None => default_resolver()?,
        };
        let master = MitmMasterProxy::bind(
            listen,
            resolver,
            policy.clone(),
            auth.clone(),
            dns_cache.clone(),
            opts.clone(),
        )
        .await?;
        masters.push(Box::new(master));
    }

    if let Some(listen) = args.udp_listen {
        let target = args.fixed_target.ok_or("--udp-listen requires --fixed-target")?;
        let master = MitmUdpProxy::bind(
            listen,
            target,
            policy.clone(),
            auth.clone(),
            dns_cache.clone(),
            opts.clone(),
        )
        .await?;
        masters.push(Box::new(master));
    }

    if let Some(listen) = args.socks_listen {
        let master = MitmSocksProxy::bind(
            listen,
            args.socks_auth.clone(),
            tls.clone(),
            policy.clone(),
            auth.clone(),
            dns_cache.clone(),
            opts.clone(),
        )
        .await?;
        masters.push(Box::new(master));
    }

    if masters.is_empty() {
        return Err("no listeners configured".into());
    }

    let mut workers = JoinSet::new();
    for master in masters {
        let token = shutdown_token.clone();
        workers.spawn(async move {
            if let Err(err) = master.run(token).await {
                log::error!("acceptor failed: {err}");
            }
        });
    }

    workers.spawn({
        let auth = auth.clone();
        let token = shutdown_token.clone();
        async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(AUTH_SWEEP_INTERVAL_SECS)) => {
                        auth.timeout_check();
                    }
                }
            }
        }
    });

    while workers.join_next().await.is_some() {}
    let (tx, rx) = stats::totals();
    log::info!("shutting down, relayed ▲ {tx} : ▼ {rx} bytes");
    Ok(())
}

#[cfg(unix)]
use tokio::signal::unix::{self, SignalKind};
use {
    crate::{
        accounts::InMemoryAccounts,
        api,
        arguments::Arguments,
        http_client::HttpClientFactory,
    },
    anyhow::{Context, Result},
    clap::Parser,
    observe::metrics::LivenessChecking,
    rif::{
        RetryPolicy,
        Validator,
        cache::{self, VerificationCache},
        registry::{HttpRegistryGateway, InstrumentedGateway},
        validation::Backoff,
    },
    std::{
        future::Future,
        net::SocketAddr,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    },
    tokio::sync::oneshot,
};

pub async fn start(args: impl Iterator<Item = String>) {
    let args = Arguments::parse_from(args);
    observe::tracing::initialize(
        args.logging.log_filter.as_str(),
        args.logging.log_stderr_threshold,
    );
    tracing::info!("running rif service with validated arguments:\n{}", args);
    observe::metrics::setup_registry(Some("rif".into()), None);

    if let Err(err) = run(args, None).await {
        tracing::error!(?err, "rif service failed");
        std::process::exit(1);
    }
}

/// Reports the service as alive until a shutdown was requested.
struct Liveness {
    shutting_down: AtomicBool,
}

#[async_trait::async_trait]
impl LivenessChecking for Liveness {
    async fn is_alive(&self) -> bool {
        !self.shutting_down.load(Ordering::Acquire)
    }
}

pub async fn run(args: Arguments, bind: Option<oneshot::Sender<SocketAddr>>) -> Result<()> {
    let http_factory = HttpClientFactory::new(&args.http_client);
    let gateway = InstrumentedGateway::new(
        HttpRegistryGateway::new(
            http_factory
                .create()
                .context("failed to create registry http client")?,
            args.registry_url.clone(),
            args.registry_not_found_codes.clone(),
        ),
        "seniat".to_string(),
    );

    let cache = VerificationCache::new(cache::Config {
        ttl: args.cache.cache_ttl,
        grace_multiplier: args.cache.cache_grace_multiplier,
        max_entries: args.cache.cache_max_entries,
    });
    let maintenance = cache.spawn_maintenance_task(args.cache.cache_maintenance_interval);

    let validator = Arc::new(Validator::new(
        Arc::new(gateway),
        cache,
        interactive_policy(&args),
        authoritative_policy(&args),
    ));
    let accounts = Arc::new(InMemoryAccounts::new(args.registered_rifs.iter().copied()));
    tracing::info!(accounts = accounts.len(), "seeded account directory");

    let liveness = Arc::new(Liveness {
        shutting_down: AtomicBool::new(false),
    });
    let mut metrics_address = args.bind_address;
    metrics_address.set_port(args.metrics_port);
    let metrics_task = observe::metrics::serve_metrics(liveness.clone(), metrics_address);

    let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();
    let serve_api = serve_api(
        api::handle_all_routes(validator, accounts),
        args.bind_address,
        bind,
        async {
            let _ = shutdown_receiver.await;
        },
    );

    tokio::pin!(serve_api);
    tokio::select! {
        result = &mut serve_api => result.context("API task exited")?,
        result = maintenance => anyhow::bail!("cache maintenance task exited: {result:?}"),
        result = metrics_task => anyhow::bail!("metrics task exited: {result:?}"),
        _ = shutdown_signal() => {
            tracing::info!("gracefully shutting down API");
            liveness.shutting_down.store(true, Ordering::Release);
            let _ = shutdown_sender.send(());
            match tokio::time::timeout(Duration::from_secs(10), serve_api).await {
                Ok(inner) => inner.context("API failed during shutdown")?,
                Err(_) => tracing::error!("API shutdown exceeded timeout"),
            }
        }
    };
    Ok(())
}

fn interactive_policy(args: &Arguments) -> RetryPolicy {
    RetryPolicy {
        deadline: args.validation.interactive_deadline,
        budget: args.validation.interactive_budget,
        ..RetryPolicy::interactive()
    }
}

fn authoritative_policy(args: &Arguments) -> RetryPolicy {
    let defaults = RetryPolicy::authoritative();
    RetryPolicy {
        deadline: args.validation.authoritative_deadline,
        retries: args.validation.authoritative_retries,
        backoff: Backoff {
            initial: args.validation.authoritative_backoff,
            max: defaults
                .backoff
                .max
                .max(args.validation.authoritative_backoff),
            ..defaults.backoff
        },
        budget: args.validation.authoritative_budget,
        ..defaults
    }
}

async fn serve_api(
    app: axum::Router,
    address: SocketAddr,
    bind: Option<oneshot::Sender<SocketAddr>>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind API to {address}"))?;
    let local_address = listener.local_addr()?;
    tracing::info!(%local_address, "serving rif API");
    if let Some(bind) = bind {
        let _ = bind.send(local_address);
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    // Intercept main signals for graceful shutdown.
    // Kubernetes sends sigterm, whereas locally sigint (ctrl-c) is most common.
    let (Ok(mut interrupt), Ok(mut terminate)) = (
        unix::signal(SignalKind::interrupt()),
        unix::signal(SignalKind::terminate()),
    ) else {
        tracing::error!("failed to install signal handlers");
        return std::future::pending().await;
    };
    tokio::select! {
        _ = interrupt.recv() => (),
        _ = terminate.recv() => (),
    };
}

#[cfg(windows)]
async fn shutdown_signal() {
    // We don't support signal handling on Windows.
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policies_follow_arguments() {
        let args = Arguments::parse_from([
            "rif-service",
            "--interactive-deadline",
            "1s",
            "--authoritative-retries",
            "3",
            "--authoritative-backoff",
            "5s",
        ]);

        let interactive = interactive_policy(&args);
        assert_eq!(interactive.deadline, Duration::from_secs(1));
        assert_eq!(interactive.retries, 1);

        let authoritative = authoritative_policy(&args);
        assert_eq!(authoritative.retries, 3);
        assert_eq!(authoritative.backoff.initial, Duration::from_secs(5));
        assert_eq!(authoritative.backoff.max, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn serves_api_until_shutdown() {
        let args = Arguments::parse_from([
            "rif-service",
            "--bind-address",
            "127.0.0.1:0",
            "--metrics-port",
            "0",
        ]);
        let (bind_sender, bind_receiver) = oneshot::channel();
        let service = tokio::spawn(run(args, Some(bind_sender)));

        let address = bind_receiver.await.unwrap();
        let response = reqwest::get(format!("http://{address}/api/v1/rif/X1/check"))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.text().await.unwrap(),
            r#"{"valid":false,"reason":"bad-kind","exists":"unknown"}"#
        );
        service.abort();
    }
}

use {
    crate::http_client,
    rif::{Identifier, registry::HttpRegistryGateway},
    std::{
        fmt::{self, Display, Formatter},
        net::SocketAddr,
        time::Duration,
    },
    tracing::level_filters::LevelFilter,
    url::Url,
};

#[derive(clap::Parser)]
pub struct Arguments {
    #[clap(flatten)]
    pub logging: LoggingArguments,

    #[clap(flatten)]
    pub http_client: http_client::Arguments,

    #[clap(flatten)]
    pub cache: CacheArguments,

    #[clap(flatten)]
    pub validation: ValidationArguments,

    #[clap(long, env, default_value = "0.0.0.0:8080")]
    pub bind_address: SocketAddr,

    /// Port serving `/metrics` and `/liveness` on the interface of
    /// `bind_address`.
    #[clap(long, env, default_value_t = observe::metrics::DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Taxpayer lookup endpoint of the registry. The identifier is appended
    /// as the `rif` query parameter.
    #[clap(long, env, default_value = HttpRegistryGateway::DEFAULT_URL)]
    pub registry_url: Url,

    /// Bodies the registry answers with for identifiers it does not know.
    #[clap(long, env, default_value = "450,452", value_delimiter = ',')]
    pub registry_not_found_codes: Vec<String>,

    /// Identifiers that are already bound to accounts when the service
    /// starts.
    #[clap(long, env, value_delimiter = ',')]
    pub registered_rifs: Vec<Identifier>,
}

#[derive(clap::Parser)]
#[group(skip)]
pub struct LoggingArguments {
    #[clap(long, env, default_value = "warn,rif=debug,rif_service=debug")]
    pub log_filter: String,

    #[clap(long, env, default_value = "error")]
    pub log_stderr_threshold: LevelFilter,
}

#[derive(clap::Parser)]
#[group(skip)]
pub struct CacheArguments {
    /// How long a registry answer is served from the cache.
    #[clap(
        long,
        env,
        default_value = "6h",
        value_parser = humantime::parse_duration,
    )]
    pub cache_ttl: Duration,

    /// Cached answers that were not refreshed for this many TTLs are evicted.
    #[clap(long, env, default_value = "4")]
    pub cache_grace_multiplier: u32,

    /// Maximum number of cached answers.
    #[clap(long, env, default_value = "100000")]
    pub cache_max_entries: usize,

    /// How often expired cache entries are evicted.
    #[clap(
        long,
        env,
        default_value = "1m",
        value_parser = humantime::parse_duration,
    )]
    pub cache_maintenance_interval: Duration,
}

#[derive(clap::Parser)]
#[group(skip)]
pub struct ValidationArguments {
    /// Deadline of a registry call made for interactive feedback.
    #[clap(
        long,
        env,
        default_value = "2s",
        value_parser = humantime::parse_duration,
    )]
    pub interactive_deadline: Duration,

    /// Overall time an interactive check may take.
    #[clap(
        long,
        env,
        default_value = "5s",
        value_parser = humantime::parse_duration,
    )]
    pub interactive_budget: Duration,

    /// Deadline of a registry call made at registration time.
    #[clap(
        long,
        env,
        default_value = "10s",
        value_parser = humantime::parse_duration,
    )]
    pub authoritative_deadline: Duration,

    /// Retries of a registry call made at registration time.
    #[clap(long, env, default_value = "2")]
    pub authoritative_retries: u32,

    /// Delay before the first retry at registration time. Doubles with every
    /// further retry.
    #[clap(
        long,
        env,
        default_value = "500ms",
        value_parser = humantime::parse_duration,
    )]
    pub authoritative_backoff: Duration,

    /// Overall time a registration check may take.
    #[clap(
        long,
        env,
        default_value = "35s",
        value_parser = humantime::parse_duration,
    )]
    pub authoritative_budget: Duration,
}

impl Display for Arguments {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let Self {
            logging,
            http_client,
            cache,
            validation,
            bind_address,
            metrics_port,
            registry_url,
            registry_not_found_codes,
            registered_rifs,
        } = self;

        write!(f, "{}", logging)?;
        write!(f, "{}", http_client)?;
        write!(f, "{}", cache)?;
        write!(f, "{}", validation)?;
        writeln!(f, "bind_address: {}", bind_address)?;
        writeln!(f, "metrics_port: {}", metrics_port)?;
        writeln!(f, "registry_url: {}", redact(registry_url))?;
        writeln!(
            f,
            "registry_not_found_codes: {:?}",
            registry_not_found_codes
        )?;
        writeln!(f, "registered_rifs: {} identifiers", registered_rifs.len())?;
        Ok(())
    }
}

impl Display for LoggingArguments {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let Self {
            log_filter,
            log_stderr_threshold,
        } = self;

        writeln!(f, "log_filter: {}", log_filter)?;
        writeln!(f, "log_stderr_threshold: {}", log_stderr_threshold)
    }
}

impl Display for CacheArguments {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let Self {
            cache_ttl,
            cache_grace_multiplier,
            cache_max_entries,
            cache_maintenance_interval,
        } = self;

        writeln!(f, "cache_ttl: {:?}", cache_ttl)?;
        writeln!(f, "cache_grace_multiplier: {}", cache_grace_multiplier)?;
        writeln!(f, "cache_max_entries: {}", cache_max_entries)?;
        writeln!(
            f,
            "cache_maintenance_interval: {:?}",
            cache_maintenance_interval
        )
    }
}

impl Display for ValidationArguments {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let Self {
            interactive_deadline,
            interactive_budget,
            authoritative_deadline,
            authoritative_retries,
            authoritative_backoff,
            authoritative_budget,
        } = self;

        writeln!(f, "interactive_deadline: {:?}", interactive_deadline)?;
        writeln!(f, "interactive_budget: {:?}", interactive_budget)?;
        writeln!(f, "authoritative_deadline: {:?}", authoritative_deadline)?;
        writeln!(f, "authoritative_retries: {}", authoritative_retries)?;
        writeln!(f, "authoritative_backoff: {:?}", authoritative_backoff)?;
        writeln!(f, "authoritative_budget: {:?}", authoritative_budget)
    }
}

/// Hides credentials that may be part of a URL.
fn redact(url: &Url) -> String {
    let mut url = url.clone();
    if url.password().is_some() {
        let _ = url.set_password(Some("SECRET"));
    }
    url.to_string()
}

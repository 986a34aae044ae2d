use {
    reqwest::{Client, ClientBuilder},
    std::{
        fmt::{self, Display, Formatter},
        time::Duration,
    },
};

const USER_AGENT: &str = concat!("rif-service/", env!("CARGO_PKG_VERSION"));

/// An HTTP client factory.
///
/// Gives all outgoing HTTP clients a common configuration while still
/// allowing separate connection pools per API.
#[derive(Clone, Debug)]
pub struct HttpClientFactory {
    timeout: Duration,
    connect_timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(args: &Arguments) -> Self {
        Self {
            timeout: args.http_timeout,
            connect_timeout: args.http_connect_timeout,
        }
    }

    /// Creates a new HTTP client with the default settings.
    pub fn create(&self) -> reqwest::Result<Client> {
        self.builder().build()
    }

    /// Returns a `ClientBuilder` with the default settings.
    pub fn builder(&self) -> ClientBuilder {
        ClientBuilder::new()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .user_agent(USER_AGENT)
    }
}

impl Default for HttpClientFactory {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Command line arguments for the common HTTP factory.
#[derive(clap::Parser)]
#[group(skip)]
pub struct Arguments {
    /// Upper bound for any http request. Registry calls are additionally
    /// bounded by the per validation deadlines.
    #[clap(
        long,
        env,
        default_value = "30s",
        value_parser = humantime::parse_duration,
    )]
    pub http_timeout: Duration,

    /// Timeout for establishing a connection.
    #[clap(
        long,
        env,
        default_value = "5s",
        value_parser = humantime::parse_duration,
    )]
    pub http_connect_timeout: Duration,
}

impl Display for Arguments {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let Self {
            http_timeout,
            http_connect_timeout,
        } = self;

        writeln!(f, "http_timeout: {:?}", http_timeout)?;
        writeln!(f, "http_connect_timeout: {:?}", http_connect_timeout)
    }
}

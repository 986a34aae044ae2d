use {
    super::{RegistryGateway, RegistryResult, UnavailableCause},
    crate::identifier::Identifier,
    reqwest::Client,
    std::time::Duration,
    url::Url,
};

/// Gateway talking to the registry's public taxpayer lookup page.
///
/// The page answers with a small XML document describing the taxpayer when
/// the identifier is known and with a bare numeric status code otherwise.
pub struct HttpRegistryGateway {
    client: Client,
    url: Url,
    not_found_codes: Vec<String>,
}

impl HttpRegistryGateway {
    pub const DEFAULT_URL: &'static str =
        "http://contribuyente.seniat.gob.ve/getContribuyente/getrif";

    /// Status codes the registry uses for identifiers it does not know.
    pub const DEFAULT_NOT_FOUND_CODES: [&'static str; 2] = ["450", "452"];

    /// Encoding of responses that do not name a charset in their content type.
    const DEFAULT_CHARSET: &'static str = "ISO-8859-1";

    pub fn new(client: Client, url: Url, not_found_codes: Vec<String>) -> Self {
        Self {
            client,
            url,
            not_found_codes,
        }
    }

    fn request_url(&self, identifier: &Identifier) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("rif", &identifier.canonical());
        url
    }

    async fn fetch(&self, url: Url) -> Result<String, reqwest::Error> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text_with_charset(Self::DEFAULT_CHARSET)
            .await
    }
}

#[async_trait::async_trait]
impl RegistryGateway for HttpRegistryGateway {
    async fn check(&self, identifier: Identifier, deadline: Duration) -> RegistryResult {
        let url = self.request_url(&identifier);
        tracing::trace!(%url, "querying registry");

        // Dropping the request future on timeout aborts the connection.
        match tokio::time::timeout(deadline, self.fetch(url)).await {
            Err(_) => RegistryResult::Unavailable(UnavailableCause::Timeout),
            Ok(Err(err)) if err.is_timeout() => {
                RegistryResult::Unavailable(UnavailableCause::Timeout)
            }
            Ok(Err(err)) => {
                tracing::debug!(?err, %identifier, "registry request failed");
                RegistryResult::Unavailable(UnavailableCause::TransportError)
            }
            Ok(Ok(body)) => classify(&identifier, &body, &self.not_found_codes),
        }
    }
}

/// Maps a registry response body to a result. Anything that is neither a
/// record for the requested identifier nor a known "not found" code is
/// treated as malformed.
fn classify(identifier: &Identifier, body: &str, not_found_codes: &[String]) -> RegistryResult {
    let body = body.trim();
    if not_found_codes.iter().any(|code| code == body) {
        return RegistryResult::NotFound;
    }

    match attribute(body, "numeroRif") {
        Some(rif) if rif.eq_ignore_ascii_case(&identifier.canonical()) => {
            RegistryResult::Found {
                name: element_text(body, "Nombre"),
            }
        }
        Some(rif) => {
            tracing::warn!(%identifier, %rif, "registry answered for a different identifier");
            RegistryResult::Unavailable(UnavailableCause::MalformedResponse)
        }
        None => {
            tracing::debug!(%identifier, %body, "unrecognized registry response");
            RegistryResult::Unavailable(UnavailableCause::MalformedResponse)
        }
    }
}

/// Value of the first `name="..."` attribute, ignoring namespace prefixes.
fn attribute<'a>(body: &'a str, name: &str) -> Option<&'a str> {
    let pattern = format!("{name}=\"");
    let start = body.find(&pattern)? + pattern.len();
    let end = body[start..].find('"')?;
    Some(&body[start..start + end])
}

/// Text content of the first element with the given local name.
fn element_text(body: &str, name: &str) -> Option<String> {
    let pattern = format!("{name}>");
    let start = body.find(&pattern)? + pattern.len();
    let end = body[start..].find('<')?;
    let text = body[start..start + end].trim();
    (!text.is_empty()).then(|| text.to_string())
}

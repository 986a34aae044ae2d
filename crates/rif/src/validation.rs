//! The two consumer flows built on top of the format check, the verification
//! cache and the registry gateway.
//!
//! Interactive checks give quick feedback while a user is typing and may
//! answer "unknown". Authoritative checks gate account registration and only
//! succeed when the registry affirmatively confirmed the identifier.

use {
    crate::{
        cache::{Lookup, StaleFallback, VerificationCache},
        identifier::{Identifier, IdentifierFormat, InvalidReason, ValidationOutcome},
        registry::{RegistryGateway, UnavailableCause},
    },
    prometheus::IntCounterVec,
    serde::{Serialize, Serializer},
    std::{
        sync::Arc,
        time::{Duration, Instant},
    },
};

/// Consumed collaborator answering whether an identifier is already bound to
/// an account.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait::async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn is_registered(&self, identifier: &Identifier) -> bool;
}

/// Exponential backoff between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl Backoff {
    fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(self.factor).min(self.max)
    }
}

/// How registry lookups of one flow are attempted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Deadline of a single registry call.
    pub deadline: Duration,
    /// Attempts after the first one.
    pub retries: u32,
    pub backoff: Backoff,
    /// Causes that deserve another attempt.
    pub retry_on: Vec<UnavailableCause>,
    /// Wall clock budget of all attempts and backoff sleeps together.
    pub budget: Duration,
}

impl RetryPolicy {
    /// Short deadline and a single retry on timeouts.
    pub fn interactive() -> Self {
        Self {
            deadline: Duration::from_secs(2),
            retries: 1,
            backoff: Backoff {
                initial: Duration::from_millis(100),
                factor: 2,
                max: Duration::from_millis(100),
            },
            retry_on: vec![UnavailableCause::Timeout],
            budget: Duration::from_secs(5),
        }
    }

    /// Longer deadline and two retries on any unavailability.
    pub fn authoritative() -> Self {
        Self {
            deadline: Duration::from_secs(10),
            retries: 2,
            backoff: Backoff {
                initial: Duration::from_millis(500),
                factor: 2,
                max: Duration::from_secs(2),
            },
            retry_on: vec![
                UnavailableCause::Timeout,
                UnavailableCause::TransportError,
                UnavailableCause::MalformedResponse,
            ],
            budget: Duration::from_secs(35),
        }
    }

    fn is_retryable(&self, cause: UnavailableCause) -> bool {
        self.retry_on.contains(&cause)
    }
}

/// Answer of the registry as seen by an interactive check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Existence {
    Exists,
    Absent,
    Unknown,
}

impl From<bool> for Existence {
    fn from(exists: bool) -> Self {
        if exists { Self::Exists } else { Self::Absent }
    }
}

/// Serialized as `true`, `false` or `"unknown"`.
impl Serialize for Existence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Exists => serializer.serialize_bool(true),
            Self::Absent => serializer.serialize_bool(false),
            Self::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InteractiveCheck {
    pub format: ValidationOutcome,
    pub exists: Existence,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("invalid identifier: {0}")]
    InvalidFormat(InvalidReason),
    #[error("identifier is already bound to an account")]
    AlreadyRegistered,
    #[error("identifier does not exist in the registry")]
    NotFoundInRegistry,
    #[error("registry unreachable, try again later: {0}")]
    RegistryUnreachable(UnavailableCause),
}

impl RegistrationError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidFormat(_) => "invalid-format",
            Self::AlreadyRegistered => "already-registered",
            Self::NotFoundInRegistry => "not-found-in-registry",
            Self::RegistryUnreachable(_) => "registry-unreachable",
        }
    }
}

/// Failure of a plain existence lookup. A missing identifier is an answer,
/// not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ExistenceError {
    #[error("invalid identifier: {0}")]
    InvalidFormat(InvalidReason),
    #[error("registry unreachable, try again later: {0}")]
    RegistryUnreachable(UnavailableCause),
}

/// Failure of the taxpayer data lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("invalid identifier: {0}")]
    InvalidFormat(InvalidReason),
    #[error("identifier does not exist in the registry")]
    NotFoundInRegistry,
    #[error("registry unreachable, try again later: {0}")]
    RegistryUnreachable(UnavailableCause),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LoginError {
    #[error("invalid identifier: {0}")]
    InvalidFormat(InvalidReason),
    #[error("identifier is not bound to any account")]
    UserNotRegistered,
}

/// Registered taxpayer data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Taxpayer {
    pub rif: Identifier,
    pub name: Option<String>,
}

/// Entry point of all identifier validation.
pub struct Validator {
    format: IdentifierFormat,
    gateway: Arc<dyn RegistryGateway>,
    cache: Arc<VerificationCache>,
    interactive: RetryPolicy,
    authoritative: RetryPolicy,
}

impl Validator {
    pub fn new(
        gateway: Arc<dyn RegistryGateway>,
        cache: Arc<VerificationCache>,
        interactive: RetryPolicy,
        authoritative: RetryPolicy,
    ) -> Self {
        Metrics::get().reset();
        Self {
            format: Default::default(),
            gateway,
            cache,
            interactive,
            authoritative,
        }
    }

    pub fn parse(&self, raw: &str) -> ValidationOutcome {
        self.format.parse(raw)
    }

    pub fn parse_parts(&self, kind: &str, body: &str, check: &str) -> ValidationOutcome {
        self.format.parse_parts(kind, body, check)
    }

    /// Quick pre-submit feedback. Never fails: a malformed identifier is
    /// reported in `format` without touching the network and an unreachable
    /// registry yields [`Existence::Unknown`].
    pub async fn validate_interactive(&self, raw: &str) -> InteractiveCheck {
        let format = self.format.parse(raw);
        let ValidationOutcome::Valid(identifier) = format else {
            Metrics::get().outcome("interactive", "invalid-format");
            return InteractiveCheck {
                format,
                exists: Existence::Unknown,
            };
        };

        let exists = match self
            .lookup(identifier, &self.interactive, StaleFallback::Allow)
            .await
        {
            Ok(lookup) => Existence::from(lookup.exists),
            Err(cause) => {
                tracing::debug!(%identifier, ?cause, "registry unavailable for interactive check");
                Existence::Unknown
            }
        };
        let outcome = match exists {
            Existence::Exists => "exists",
            Existence::Absent => "absent",
            Existence::Unknown => "unknown",
        };
        Metrics::get().outcome("interactive", outcome);
        tracing::debug!(%identifier, outcome, "interactive check");
        InteractiveCheck { format, exists }
    }

    /// Check at registration time. Succeeds only for a well formed identifier
    /// that is not bound to an account yet and that the registry confirmed.
    pub async fn validate_authoritative(
        &self,
        raw: &str,
        already_registered: &dyn AccountDirectory,
    ) -> Result<Identifier, RegistrationError> {
        let result = self.authoritative_check(raw, already_registered).await;
        let outcome = match &result {
            Ok(_) => "confirmed",
            Err(err) => err.as_str(),
        };
        Metrics::get().outcome("authoritative", outcome);
        match &result {
            Ok(identifier) => tracing::info!(%identifier, outcome, "authoritative check"),
            Err(err) => tracing::info!(raw, outcome, %err, "authoritative check"),
        }
        result
    }

    async fn authoritative_check(
        &self,
        raw: &str,
        already_registered: &dyn AccountDirectory,
    ) -> Result<Identifier, RegistrationError> {
        let identifier = self
            .format
            .parse(raw)
            .into_result()
            .map_err(RegistrationError::InvalidFormat)?;
        if already_registered.is_registered(&identifier).await {
            return Err(RegistrationError::AlreadyRegistered);
        }
        let lookup = self
            .lookup(identifier, &self.authoritative, StaleFallback::Deny)
            .await
            .map_err(RegistrationError::RegistryUnreachable)?;
        if !lookup.exists {
            return Err(RegistrationError::NotFoundInRegistry);
        }
        Ok(identifier)
    }

    /// Existence lookup with the authoritative retry policy.
    pub async fn check_existence(&self, raw: &str) -> Result<bool, ExistenceError> {
        let identifier = self
            .format
            .parse(raw)
            .into_result()
            .map_err(ExistenceError::InvalidFormat)?;
        let lookup = self
            .lookup(identifier, &self.authoritative, StaleFallback::Deny)
            .await
            .map_err(ExistenceError::RegistryUnreachable)?;
        Ok(lookup.exists)
    }

    /// Taxpayer data as reported by the registry, used to prefill the
    /// registration form.
    pub async fn taxpayer_name(&self, raw: &str) -> Result<Taxpayer, LookupError> {
        let identifier = self
            .format
            .parse(raw)
            .into_result()
            .map_err(LookupError::InvalidFormat)?;
        let lookup = self
            .lookup(identifier, &self.authoritative, StaleFallback::Deny)
            .await
            .map_err(LookupError::RegistryUnreachable)?;
        if !lookup.exists {
            return Err(LookupError::NotFoundInRegistry);
        }
        Ok(Taxpayer {
            rif: identifier,
            name: lookup.name,
        })
    }

    /// Check at login time. Only well formed identifiers bound to an account
    /// may log in. The registry is not consulted.
    pub async fn validate_login(
        &self,
        raw: &str,
        accounts: &dyn AccountDirectory,
    ) -> Result<Identifier, LoginError> {
        let identifier = self
            .format
            .parse(raw)
            .into_result()
            .map_err(LoginError::InvalidFormat)?;
        if !accounts.is_registered(&identifier).await {
            return Err(LoginError::UserNotRegistered);
        }
        Ok(identifier)
    }

    /// Looks the identifier up through the cache, retrying unavailability as
    /// the policy allows.
    async fn lookup(
        &self,
        identifier: Identifier,
        policy: &RetryPolicy,
        stale: StaleFallback,
    ) -> Result<Lookup, UnavailableCause> {
        let start = Instant::now();
        let ttl = self.cache.config().ttl;
        let mut backoff = policy.backoff.initial;
        let mut attempt = 0;
        loop {
            let remaining = policy.budget.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(UnavailableCause::Timeout);
            }
            let deadline = policy.deadline.min(remaining);
            let gateway = self.gateway.clone();
            let fetch = move |identifier: Identifier| async move { gateway.check(identifier, deadline).await };
            let cause = match self
                .cache
                .lookup_or_fetch(identifier, fetch, Instant::now(), ttl, stale)
                .await
            {
                Ok(lookup) => return Ok(lookup),
                Err(cause) => cause,
            };

            if attempt >= policy.retries || !policy.is_retryable(cause) {
                return Err(cause);
            }
            if start.elapsed() + backoff >= policy.budget {
                tracing::debug!(%identifier, ?cause, "retry would exceed the validation budget");
                return Err(cause);
            }
            attempt += 1;
            tracing::debug!(%identifier, ?cause, attempt, ?backoff, "retrying registry lookup");
            tokio::time::sleep(backoff).await;
            backoff = policy.backoff.next(backoff);
        }
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
struct Metrics {
    /// Terminal states of validation flows.
    #[metric(labels("flow", "outcome"))]
    validations: IntCounterVec,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }

    fn reset(&self) {
        for outcome in ["invalid-format", "exists", "absent", "unknown"] {
            self.validations
                .with_label_values(&["interactive", outcome])
                .reset();
        }
        for outcome in [
            "confirmed",
            "invalid-format",
            "already-registered",
            "not-found-in-registry",
            "registry-unreachable",
        ] {
            self.validations
                .with_label_values(&["authoritative", outcome])
                .reset();
        }
    }

    fn outcome(&self, flow: &str, outcome: &str) {
        self.validations.with_label_values(&[flow, outcome]).inc();
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            cache::Config,
            identifier::Kind,
            registry::{MockRegistryGateway, RegistryResult},
        },
        mockall::{Sequence, predicate::eq},
    };

    fn rif() -> Identifier {
        Identifier::with_number(Kind::J, 30123456).unwrap()
    }

    fn fast(policy: RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            backoff: Backoff {
                initial: Duration::from_millis(1),
                factor: 2,
                max: Duration::from_millis(4),
            },
            ..policy
        }
    }

    fn validator_with_cache(gateway: MockRegistryGateway, cache: Arc<VerificationCache>) -> Validator {
        Validator::new(
            Arc::new(gateway),
            cache,
            fast(RetryPolicy::interactive()),
            fast(RetryPolicy::authoritative()),
        )
    }

    fn validator(gateway: MockRegistryGateway) -> Validator {
        validator_with_cache(gateway, VerificationCache::new(Config::default()))
    }

    fn unregistered() -> MockAccountDirectory {
        let mut accounts = MockAccountDirectory::new();
        accounts.expect_is_registered().returning(|_| false);
        accounts
    }

    fn timeout(_: Identifier, _: Duration) -> RegistryResult {
        RegistryResult::Unavailable(UnavailableCause::Timeout)
    }

    #[tokio::test]
    async fn interactive_rejects_malformed_input_without_network() {
        // No expectations: any registry call fails the test.
        let validator = validator(MockRegistryGateway::new());
        let check = validator.validate_interactive("X301234561").await;
        assert_eq!(
            check,
            InteractiveCheck {
                format: ValidationOutcome::Invalid(InvalidReason::BadKind),
                exists: Existence::Unknown,
            }
        );
        let check = validator.validate_interactive("J-30123456-8").await;
        assert_eq!(
            check.format,
            ValidationOutcome::Invalid(InvalidReason::BadCheckDigit)
        );
    }

    #[tokio::test]
    async fn interactive_reports_registry_answer() {
        let mut gateway = MockRegistryGateway::new();
        gateway
            .expect_check()
            .with(eq(rif()), eq(Duration::from_secs(2)))
            .times(1)
            .returning(|_, _| RegistryResult::Found { name: None });
        let validator = validator(gateway);

        let check = validator.validate_interactive("j-30123456-1").await;
        assert_eq!(check.format, ValidationOutcome::Valid(rif()));
        assert_eq!(check.exists, Existence::Exists);
    }

    #[tokio::test]
    async fn interactive_retries_timeouts_once() {
        let mut gateway = MockRegistryGateway::new();
        gateway.expect_check().times(2).returning(timeout);
        let validator = validator(gateway);

        let check = validator.validate_interactive("J301234561").await;
        assert_eq!(check.exists, Existence::Unknown);
    }

    #[tokio::test]
    async fn interactive_does_not_retry_other_failures() {
        let mut gateway = MockRegistryGateway::new();
        gateway
            .expect_check()
            .times(1)
            .returning(|_, _| RegistryResult::Unavailable(UnavailableCause::TransportError));
        let validator = validator(gateway);

        let check = validator.validate_interactive("J301234561").await;
        assert_eq!(check.exists, Existence::Unknown);
    }

    #[tokio::test]
    async fn not_found_is_final_and_cached() {
        let mut gateway = MockRegistryGateway::new();
        gateway
            .expect_check()
            .times(1)
            .returning(|_, _| RegistryResult::NotFound);
        let validator = validator(gateway);

        for _ in 0..2 {
            let result = validator
                .validate_authoritative("J301234561", &unregistered())
                .await;
            assert_eq!(result, Err(RegistrationError::NotFoundInRegistry));
        }
        let check = validator.validate_interactive("J301234561").await;
        assert_eq!(check.exists, Existence::Absent);
    }

    #[tokio::test]
    async fn authoritative_gives_up_after_three_timeouts() {
        let mut gateway = MockRegistryGateway::new();
        gateway.expect_check().times(3).returning(timeout);
        let validator = validator(gateway);

        let result = validator
            .validate_authoritative("J301234561", &unregistered())
            .await;
        assert_eq!(
            result,
            Err(RegistrationError::RegistryUnreachable(
                UnavailableCause::Timeout
            ))
        );
        assert_eq!(
            validator.check_existence("J301234561").await,
            Err(ExistenceError::RegistryUnreachable(UnavailableCause::Timeout))
        );
    }

    #[tokio::test]
    async fn same_outage_is_unknown_interactively() {
        let mut gateway = MockRegistryGateway::new();
        // 3 authoritative attempts followed by 2 interactive ones.
        gateway.expect_check().times(5).returning(timeout);
        let validator = validator(gateway);

        let result = validator
            .validate_authoritative("J301234561", &unregistered())
            .await;
        assert!(matches!(
            result,
            Err(RegistrationError::RegistryUnreachable(_))
        ));
        let check = validator.validate_interactive("J301234561").await;
        assert_eq!(check.exists, Existence::Unknown);
    }

    #[tokio::test]
    async fn authoritative_recovers_from_transient_failure() {
        let mut gateway = MockRegistryGateway::new();
        let mut sequence = Sequence::new();
        gateway
            .expect_check()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| RegistryResult::Unavailable(UnavailableCause::MalformedResponse));
        gateway
            .expect_check()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| RegistryResult::Found { name: None });
        let validator = validator(gateway);

        let result = validator
            .validate_authoritative("J-30123456-1", &unregistered())
            .await;
        assert_eq!(result, Ok(rif()));
    }

    #[tokio::test]
    async fn duplicate_short_circuits_registry() {
        let validator = validator(MockRegistryGateway::new());
        let mut accounts = MockAccountDirectory::new();
        accounts
            .expect_is_registered()
            .withf(|identifier| *identifier == rif())
            .times(1)
            .returning(|_| true);

        let result = validator
            .validate_authoritative("J301234561", &accounts)
            .await;
        assert_eq!(result, Err(RegistrationError::AlreadyRegistered));
    }

    #[tokio::test]
    async fn invalid_format_skips_duplicate_check() {
        let validator = validator(MockRegistryGateway::new());
        let result = validator
            .validate_authoritative("J3012345", &MockAccountDirectory::new())
            .await;
        assert_eq!(
            result,
            Err(RegistrationError::InvalidFormat(InvalidReason::BadLength))
        );
    }

    #[tokio::test]
    async fn stale_records_only_serve_interactive_checks() {
        let cache = VerificationCache::new(Config {
            ttl: Duration::from_millis(20),
            ..Default::default()
        });
        cache.put(rif(), true, Instant::now());
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut gateway = MockRegistryGateway::new();
        gateway.expect_check().returning(timeout);
        let validator = validator_with_cache(gateway, cache);

        let check = validator.validate_interactive("J301234561").await;
        assert_eq!(check.exists, Existence::Exists);
        let result = validator
            .validate_authoritative("J301234561", &unregistered())
            .await;
        assert_eq!(
            result,
            Err(RegistrationError::RegistryUnreachable(
                UnavailableCause::Timeout
            ))
        );
    }

    #[tokio::test]
    async fn attempts_are_clipped_to_budget() {
        let mut gateway = MockRegistryGateway::new();
        gateway
            .expect_check()
            .withf(|_, deadline| *deadline <= Duration::from_millis(50))
            .times(1)
            .returning(timeout);
        let policy = RetryPolicy {
            budget: Duration::from_millis(50),
            backoff: Backoff {
                initial: Duration::from_millis(100),
                factor: 2,
                max: Duration::from_millis(100),
            },
            ..RetryPolicy::authoritative()
        };
        let validator = Validator::new(
            Arc::new(gateway),
            VerificationCache::new(Config::default()),
            RetryPolicy::interactive(),
            policy,
        );

        assert_eq!(
            validator.check_existence("J301234561").await,
            Err(ExistenceError::RegistryUnreachable(UnavailableCause::Timeout))
        );
    }

    #[test]
    fn backoff_grows_up_to_max() {
        let backoff = RetryPolicy::authoritative().backoff;
        let delays: Vec<_> = std::iter::successors(Some(backoff.initial), |delay| {
            Some(backoff.next(*delay))
        })
        .take(4)
        .collect();
        assert_eq!(
            delays,
            [500, 1000, 2000, 2000].map(Duration::from_millis).to_vec()
        );
    }

    #[tokio::test]
    async fn looks_up_taxpayer_name() {
        let mut gateway = MockRegistryGateway::new();
        gateway.expect_check().times(1).returning(|_, _| RegistryResult::Found {
            name: Some("INVERSIONES EJEMPLO C A".to_string()),
        });
        let validator = validator(gateway);

        let taxpayer = validator.taxpayer_name("J301234561").await.unwrap();
        assert_eq!(taxpayer.rif, rif());
        assert_eq!(taxpayer.name.as_deref(), Some("INVERSIONES EJEMPLO C A"));
        // Served from the cache.
        assert!(validator.check_existence("J301234561").await.unwrap());
    }

    #[tokio::test]
    async fn taxpayer_must_exist() {
        let mut gateway = MockRegistryGateway::new();
        gateway
            .expect_check()
            .returning(|_, _| RegistryResult::NotFound);
        let validator = validator(gateway);

        assert_eq!(
            validator.taxpayer_name("J301234561").await,
            Err(LookupError::NotFoundInRegistry)
        );
        assert_eq!(
            validator.taxpayer_name("J30123456").await,
            Err(LookupError::InvalidFormat(InvalidReason::BadLength))
        );
        // The same answer is a plain `false` for existence lookups.
        assert_eq!(validator.check_existence("J301234561").await, Ok(false));
        assert_eq!(
            validator.check_existence("J30123456").await,
            Err(ExistenceError::InvalidFormat(InvalidReason::BadLength))
        );
    }

    #[tokio::test]
    async fn login_requires_bound_identifier() {
        let validator = validator(MockRegistryGateway::new());
        let mut accounts = MockAccountDirectory::new();
        accounts
            .expect_is_registered()
            .returning(|identifier| identifier.kind() == Kind::J);

        assert_eq!(
            validator.validate_login("j-30123456-1", &accounts).await,
            Ok(rif())
        );
        assert_eq!(
            validator.validate_login("G200003030", &accounts).await,
            Err(LoginError::UserNotRegistered)
        );
        assert_eq!(
            validator.validate_login("J30123456A", &accounts).await,
            Err(LoginError::InvalidFormat(InvalidReason::NonNumericBody))
        );
    }

    #[test]
    fn existence_serialization() {
        assert_eq!(
            serde_json::to_string(&[Existence::Exists, Existence::Absent, Existence::Unknown])
                .unwrap(),
            r#"[true,false,"unknown"]"#
        );
    }
}

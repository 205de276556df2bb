//! Upstream salary API client: query parameter mapping, transport seam and
//! the bounded retry loop with jittered delays.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use salary_core::{group_count, Category, ReferenceEntity};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "salary-client";

pub const EMPLOYMENT_TYPE_KEY: &str = "employment_type";
/// Upstream value meaning "any employment type".
pub const EMPLOYMENT_TYPE_ANY: &str = "0";
pub const SPEC_ALIASES_KEY: &str = "spec_aliases[]";
pub const SKILLS_KEY: &str = "skills[]";
pub const REGION_ALIASES_KEY: &str = "region_aliases[]";
pub const COMPANY_ALIAS_KEY: &str = "company_alias";

/// Parameters for one upstream call. Each category fills its own slot; a
/// combination merges several.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryParams {
    pub spec_alias: Option<String>,
    pub skill_aliases: Vec<String>,
    pub region_alias: Option<String>,
    pub company_alias: Option<String>,
}

impl CategoryParams {
    pub fn for_entity(category: Category, entity: &ReferenceEntity) -> Self {
        Self::for_alias(category, &entity.alias)
    }

    pub fn for_alias(category: Category, alias: &str) -> Self {
        let mut params = Self::default();
        match category {
            Category::Specialization => params.spec_alias = Some(alias.to_string()),
            Category::Skill => params.skill_aliases = vec![alias.to_string()],
            Category::Region => params.region_alias = Some(alias.to_string()),
            Category::Company => params.company_alias = Some(alias.to_string()),
        }
        params
    }

    /// Unknown category names yield an empty parameter set.
    pub fn for_category_name(name: &str, alias: &str) -> Self {
        match name.parse::<Category>() {
            Ok(category) => Self::for_alias(category, alias),
            Err(_) => Self::default(),
        }
    }

    /// Skills accumulate; the scalar slots take `other`'s value. Requests
    /// repeating a scalar category are rejected before they get here.
    pub fn merge(&mut self, other: CategoryParams) {
        if other.spec_alias.is_some() {
            self.spec_alias = other.spec_alias;
        }
        self.skill_aliases.extend(other.skill_aliases);
        if other.region_alias.is_some() {
            self.region_alias = other.region_alias;
        }
        if other.company_alias.is_some() {
            self.company_alias = other.company_alias;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.spec_alias.is_none()
            && self.skill_aliases.is_empty()
            && self.region_alias.is_none()
            && self.company_alias.is_none()
    }

    /// Query pairs in upstream naming. List-valued keys repeat once per value.
    pub fn to_query(&self) -> Vec<(String, String)> {
        let mut query = vec![(
            EMPLOYMENT_TYPE_KEY.to_string(),
            EMPLOYMENT_TYPE_ANY.to_string(),
        )];
        if let Some(alias) = &self.spec_alias {
            query.push((SPEC_ALIASES_KEY.to_string(), alias.clone()));
        }
        for alias in &self.skill_aliases {
            query.push((SKILLS_KEY.to_string(), alias.clone()));
        }
        if let Some(alias) = &self.region_alias {
            query.push((REGION_ALIASES_KEY.to_string(), alias.clone()));
        }
        if let Some(alias) = &self.company_alias {
            query.push((COMPANY_ALIAS_KEY.to_string(), alias.clone()));
        }
        query
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransientFetchError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransientFetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Result of one logical fetch after retries.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Data(JsonValue),
    Empty,
    Failed(TransientFetchError),
}

/// Uniform random delay range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    /// `None` for negative, non-finite or out-of-range seconds.
    pub fn try_from_secs_f64(min: f64, max: f64) -> Option<Self> {
        let min = Duration::try_from_secs_f64(min).ok()?;
        let max = Duration::try_from_secs_f64(max).ok()?;
        Some(Self::new(min, max))
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let secs = rand::rng().random_range(self.min.as_secs_f64()..=self.max.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub retry_attempts: u32,
    /// Slept between failed attempts.
    pub retry_delay: DelayRange,
    /// Slept once after a non-empty answer, before returning it.
    pub courtesy_delay: DelayRange,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let range = DelayRange::new(Duration::from_millis(1500), Duration::from_millis(2500));
        Self {
            retry_attempts: 3,
            retry_delay: range,
            courtesy_delay: range,
        }
    }
}

/// One raw GET against the upstream endpoint.
#[async_trait]
pub trait SalaryTransport: Send + Sync {
    async fn get_json(&self, query: &[(String, String)]) -> Result<JsonValue, TransientFetchError>;
}

/// What the orchestrator needs from the upstream side.
#[async_trait]
pub trait SalaryFetcher: Send + Sync {
    async fn fetch(&self, params: &CategoryParams) -> FetchOutcome;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url,
        })
    }
}

#[async_trait]
impl SalaryTransport for ReqwestTransport {
    async fn get_json(&self, query: &[(String, String)]) -> Result<JsonValue, TransientFetchError> {
        let resp = self.client.get(&self.base_url).query(query).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransientFetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| TransientFetchError::Decode(e.to_string()))
    }
}

pub struct SalaryApiClient {
    transport: Arc<dyn SalaryTransport>,
    config: ClientConfig,
}

impl SalaryApiClient {
    pub fn new(transport: Arc<dyn SalaryTransport>, config: ClientConfig) -> Self {
        Self { transport, config }
    }

    pub fn over_http(http: HttpClientConfig, config: ClientConfig) -> anyhow::Result<Self> {
        Ok(Self::new(Arc::new(ReqwestTransport::new(http)?), config))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[async_trait]
impl SalaryFetcher for SalaryApiClient {
    async fn fetch(&self, params: &CategoryParams) -> FetchOutcome {
        let query = params.to_query();
        let attempts = self.config.retry_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            let result = match self.transport.get_json(&query).await {
                Ok(payload) if !payload.is_object() => Err(TransientFetchError::Decode(
                    "response body is not a JSON object".to_string(),
                )),
                other => other,
            };

            match result {
                Ok(payload) => {
                    if group_count(&payload).unwrap_or(0) == 0 {
                        info!(?query, "salary api returned no groups");
                        return FetchOutcome::Empty;
                    }
                    let pause = self.config.courtesy_delay.sample();
                    debug!(?pause, "courtesy delay after successful fetch");
                    tokio::time::sleep(pause).await;
                    return FetchOutcome::Data(payload);
                }
                Err(err) => {
                    warn!(attempt = attempt + 1, attempts, error = %err, "salary api request failed");
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.config.retry_delay.sample()).await;
                    }
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) => FetchOutcome::Failed(err),
            None => FetchOutcome::Failed(TransientFetchError::Transport(
                "no request attempted".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<JsonValue, TransientFetchError>>>,
        seen: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<JsonValue, TransientFetchError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SalaryTransport for ScriptedTransport {
        async fn get_json(
            &self,
            query: &[(String, String)],
        ) -> Result<JsonValue, TransientFetchError> {
            self.seen.lock().unwrap().push(query.to_vec());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransientFetchError::Transport("script exhausted".into())))
        }
    }

    fn instant_config() -> ClientConfig {
        ClientConfig {
            retry_attempts: 3,
            retry_delay: DelayRange::none(),
            courtesy_delay: DelayRange::none(),
        }
    }

    fn salary_payload() -> JsonValue {
        json!({"groups": [{"name": "Middle", "median": 250000, "min": 150000, "max": 400000, "total": 12}]})
    }

    fn connection_refused() -> Result<JsonValue, TransientFetchError> {
        Err(TransientFetchError::Transport("connection refused".into()))
    }

    #[tokio::test]
    async fn two_transport_failures_then_success_returns_payload() {
        let transport = ScriptedTransport::new(vec![
            connection_refused(),
            connection_refused(),
            Ok(salary_payload()),
        ]);
        let client = SalaryApiClient::new(transport.clone(), instant_config());

        let outcome = client
            .fetch(&CategoryParams::for_alias(Category::Skill, "python"))
            .await;

        assert_eq!(outcome, FetchOutcome::Data(salary_payload()));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn empty_groups_short_circuit_without_retry() {
        let transport = ScriptedTransport::new(vec![Ok(json!({"groups": []})), Ok(salary_payload())]);
        let client = SalaryApiClient::new(transport.clone(), instant_config());

        let outcome = client
            .fetch(&CategoryParams::for_alias(Category::Region, "moscow"))
            .await;

        assert_eq!(outcome, FetchOutcome::Empty);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_report_last_error() {
        let transport = ScriptedTransport::new(vec![
            connection_refused(),
            Err(TransientFetchError::HttpStatus {
                status: 502,
                url: "http://upstream".into(),
            }),
            Err(TransientFetchError::Decode("expected value".into())),
        ]);
        let client = SalaryApiClient::new(transport.clone(), instant_config());

        let outcome = client
            .fetch(&CategoryParams::for_alias(Category::Company, "acme"))
            .await;

        assert_eq!(
            outcome,
            FetchOutcome::Failed(TransientFetchError::Decode("expected value".into()))
        );
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn non_object_body_is_retried_as_decode_error() {
        let transport = ScriptedTransport::new(vec![Ok(json!([1, 2, 3])), Ok(salary_payload())]);
        let client = SalaryApiClient::new(transport.clone(), instant_config());

        let outcome = client
            .fetch(&CategoryParams::for_alias(Category::Skill, "rust"))
            .await;

        assert!(matches!(outcome, FetchOutcome::Data(_)));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn delays_follow_retry_and_courtesy_ranges() {
        let transport = ScriptedTransport::new(vec![
            connection_refused(),
            connection_refused(),
            Ok(salary_payload()),
        ]);
        let client = SalaryApiClient::new(transport.clone(), ClientConfig::default());

        let start = tokio::time::Instant::now();
        let outcome = client
            .fetch(&CategoryParams::for_alias(Category::Skill, "go"))
            .await;
        let elapsed = start.elapsed();

        assert!(matches!(outcome, FetchOutcome::Data(_)));
        // two retry sleeps plus one courtesy sleep, each within [1.5s, 2.5s]
        assert!(elapsed >= Duration::from_millis(4500), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(7600), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn final_failed_attempt_does_not_sleep() {
        let transport = ScriptedTransport::new(vec![
            connection_refused(),
            connection_refused(),
            connection_refused(),
        ]);
        let client = SalaryApiClient::new(transport.clone(), ClientConfig::default());

        let start = tokio::time::Instant::now();
        let outcome = client
            .fetch(&CategoryParams::for_alias(Category::Skill, "go"))
            .await;
        let elapsed = start.elapsed();

        assert!(matches!(outcome, FetchOutcome::Failed(_)));
        assert!(elapsed >= Duration::from_millis(3000), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(5100), "elapsed {elapsed:?}");
    }

    #[test]
    fn query_uses_upstream_keys_and_lists_skills() {
        let mut params = CategoryParams::for_alias(Category::Skill, "python");
        params.merge(CategoryParams::for_alias(Category::Region, "moscow"));
        params.merge(CategoryParams::for_alias(Category::Skill, "django"));

        assert_eq!(
            params.to_query(),
            vec![
                ("employment_type".to_string(), "0".to_string()),
                ("skills[]".to_string(), "python".to_string()),
                ("skills[]".to_string(), "django".to_string()),
                ("region_aliases[]".to_string(), "moscow".to_string()),
            ]
        );
    }

    #[test]
    fn company_alias_is_scalar_and_specialization_is_listed() {
        let mut params = CategoryParams::for_alias(Category::Company, "yandex");
        params.merge(CategoryParams::for_alias(Category::Specialization, "backend"));
        let query = params.to_query();
        assert!(query.contains(&("company_alias".to_string(), "yandex".to_string())));
        assert!(query.contains(&("spec_aliases[]".to_string(), "backend".to_string())));
    }

    #[test]
    fn unknown_category_name_maps_to_empty_params() {
        let params = CategoryParams::for_category_name("vacancies", "python");
        assert!(params.is_empty());
        assert_eq!(
            params.to_query(),
            vec![("employment_type".to_string(), "0".to_string())]
        );
        assert!(!CategoryParams::for_category_name("skills", "python").is_empty());
    }

    #[test]
    fn delay_range_samples_within_bounds() {
        let range = DelayRange::try_from_secs_f64(1.5, 2.5).unwrap();
        for _ in 0..100 {
            let d = range.sample();
            assert!(d >= Duration::from_millis(1500) && d <= Duration::from_millis(2500));
        }
        assert_eq!(DelayRange::none().sample(), Duration::ZERO);
    }

    #[test]
    fn delay_range_rejects_unrepresentable_seconds() {
        assert!(DelayRange::try_from_secs_f64(-1.0, 2.0).is_none());
        assert!(DelayRange::try_from_secs_f64(1.0, f64::NAN).is_none());
        assert!(DelayRange::try_from_secs_f64(f64::INFINITY, 2.0).is_none());
        assert!(DelayRange::try_from_secs_f64(1.0, 1e300).is_none());
        assert_eq!(
            DelayRange::try_from_secs_f64(0.0, 0.0),
            Some(DelayRange::none())
        );
    }
}

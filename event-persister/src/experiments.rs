use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use moka::future::Cache;
use persister_common::experiment::{stop_at_lower_bound, Experiment, ExperimentStatus};
use persister_common::time::TimeSource;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::error::ResolveError;
use crate::metrics_consts::{
    EXPERIMENT_CACHE_HIT_COUNTER, EXPERIMENT_CACHE_MISS_COUNTER,
    EXPERIMENT_LOOKUP_ERRORS_COUNTER, EXPERIMENT_LOOKUP_SHARED_COUNTER,
};
use crate::singleflight;

const MAX_CACHED_ENVIRONMENTS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListExperimentsRequest {
    pub environment_id: String,
    pub statuses: Vec<ExperimentStatus>,
    /// Stopped experiments whose `stop_at` is older than this are not returned.
    pub stop_at_lower_bound: i64,
}

/// The service owning experiments.
#[async_trait]
pub trait ExperimentSource: Send + Sync {
    async fn list_experiments(
        &self,
        request: &ListExperimentsRequest,
    ) -> Result<Vec<Experiment>, ResolveError>;
}

#[derive(Deserialize)]
struct ListExperimentsResponse {
    #[serde(default)]
    experiments: Vec<Experiment>,
}

/// Lists experiments from the experiment service HTTP API.
pub struct HttpExperimentSource {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpExperimentSource {
    pub fn new(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    fn experiments_url(&self, environment_id: &str) -> Result<Url, ResolveError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ResolveError::Request(format!("invalid base url {}", self.base_url)))?
            .pop_if_empty()
            .extend(["api", "v1", "environments", environment_id, "experiments"]);
        Ok(url)
    }
}

fn status_param(status: ExperimentStatus) -> &'static str {
    match status {
        ExperimentStatus::Running => "RUNNING",
        ExperimentStatus::Stopped => "STOPPED",
        ExperimentStatus::Other => "OTHER",
    }
}

#[async_trait]
impl ExperimentSource for HttpExperimentSource {
    async fn list_experiments(
        &self,
        request: &ListExperimentsRequest,
    ) -> Result<Vec<Experiment>, ResolveError> {
        let url = self.experiments_url(&request.environment_id)?;
        let mut query: Vec<(&str, String)> = request
            .statuses
            .iter()
            .map(|s| ("status", status_param(*s).to_owned()))
            .collect();
        query.push(("stop_at_gte", request.stop_at_lower_bound.to_string()));

        let response = self
            .client
            .get(url)
            .query(&query)
            .send()
            .await
            .map_err(|e| ResolveError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResolveError::Status(status.as_u16()));
        }

        let body: ListExperimentsResponse = response
            .json()
            .await
            .map_err(|e| ResolveError::Request(e.to_string()))?;
        Ok(body.experiments)
    }
}

type Lookup = Result<Arc<Vec<Experiment>>, ResolveError>;

/// Resolves the experiments events of an environment may be attributed to.
///
/// Results are cached for a short TTL, and concurrent misses for one environment issue a
/// single request.
pub struct ExperimentResolver {
    source: Arc<dyn ExperimentSource>,
    cache: Cache<String, Arc<Vec<Experiment>>>,
    lookups: singleflight::Group<Lookup>,
    time: Arc<dyn TimeSource>,
}

impl ExperimentResolver {
    pub fn new(source: Arc<dyn ExperimentSource>, ttl: Duration, time: Arc<dyn TimeSource>) -> Self {
        let cache = Cache::builder()
            .max_capacity(MAX_CACHED_ENVIRONMENTS)
            .time_to_live(ttl)
            .build();

        Self {
            source,
            cache,
            lookups: singleflight::Group::new(),
            time,
        }
    }

    pub async fn resolve(&self, environment_id: &str) -> Lookup {
        if let Some(experiments) = self.cache.get(environment_id).await {
            counter!(EXPERIMENT_CACHE_HIT_COUNTER).increment(1);
            return Ok(experiments);
        }
        counter!(EXPERIMENT_CACHE_MISS_COUNTER).increment(1);

        let now = self.time.now();
        let request = ListExperimentsRequest {
            environment_id: environment_id.to_owned(),
            statuses: vec![ExperimentStatus::Running, ExperimentStatus::Stopped],
            stop_at_lower_bound: stop_at_lower_bound(now),
        };
        let source = self.source.clone();
        let cache = self.cache.clone();

        let (result, shared) = self
            .lookups
            .work(environment_id, move || async move {
                let experiments: Vec<Experiment> = source
                    .list_experiments(&request)
                    .await?
                    .into_iter()
                    .filter(|e| e.accepts_events_at(now))
                    .collect();
                debug!(
                    environment_id = %request.environment_id,
                    count = experiments.len(),
                    "resolved experiments"
                );

                let experiments = Arc::new(experiments);
                cache
                    .insert(request.environment_id, experiments.clone())
                    .await;
                Ok::<_, ResolveError>(experiments)
            })
            .await;

        if shared {
            counter!(EXPERIMENT_LOOKUP_SHARED_COUNTER).increment(1);
        }
        if let Err(e) = &result {
            counter!(EXPERIMENT_LOOKUP_ERRORS_COUNTER).increment(1);
            warn!(environment_id, "failed to resolve experiments: {}", e);
        }
        result
    }
}

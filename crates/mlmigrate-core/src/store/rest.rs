//! MLflow REST API 2.0 store.
//!
//! Maps MLflow error codes onto the engine's taxonomy:
//! - `RESOURCE_ALREADY_EXISTS` -> `AlreadyExists`
//! - `RESOURCE_DOES_NOT_EXIST` or HTTP 404 -> `NotFound`
//! - HTTP 408/429/5xx and transport failures -> `Transient`

use super::types::{
    ChildEntity, ChildPayload, ChildStatus, CreatedChild, EntityRef, Page, ParentEntity,
    ParentKind, RunData, RunLocation, VersionData,
};
use super::MetadataStore;
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

const API_PREFIX: &str = "api/2.0/mlflow/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CURRENT_STAGE_MESSAGE: &str = "Cannot update model version to its current stage";

/// MLflow tracking server client.
pub struct RestStore {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl RestStore {
    /// Create a client for the tracking server at `host`.
    pub fn new(host: &str, token: Option<String>) -> Result<Self> {
        let mut base = Url::parse(host)
            .map_err(|e| MigrateError::config(format!("invalid tracking URI '{}': {}", host, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("mlmigrate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MigrateError::config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base,
            token,
        })
    }

    pub fn host(&self) -> &str {
        self.base.as_str()
    }

    fn endpoint(&self, endpoint: &str) -> Result<Url> {
        self.base
            .join(API_PREFIX)
            .and_then(|u| u.join(endpoint))
            .map_err(|e| MigrateError::config(format!("invalid endpoint '{}': {}", endpoint, e)))
    }

    async fn get<R: DeserializeOwned>(&self, endpoint: &str, query: &[(&str, String)]) -> Result<R> {
        let url = self.endpoint(endpoint)?;
        debug!("GET {}", url);
        let mut request = self.client.get(url).query(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        decode(request.send().await?, endpoint).await
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<R> {
        let url = self.endpoint(endpoint)?;
        debug!("POST {}", url);
        let mut request = self.client.post(url).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        decode(request.send().await?, endpoint).await
    }

    async fn get_experiment_by_name(&self, name: &str) -> Result<ParentEntity> {
        let resp: ExperimentResponse = self
            .get("experiments/get-by-name", &[("experiment_name", name.to_string())])
            .await?;
        Ok(resp.experiment.into())
    }

    async fn get_experiment(&self, id: &str) -> Result<ParentEntity> {
        let resp: ExperimentResponse = self
            .get("experiments/get", &[("experiment_id", id.to_string())])
            .await?;
        Ok(resp.experiment.into())
    }

    async fn get_model(&self, name: &str) -> Result<ParentEntity> {
        let resp: RegisteredModelResponse = self
            .get("registered-models/get", &[("name", name.to_string())])
            .await?;
        Ok(resp.registered_model.into())
    }

    async fn get_version(&self, model: &str, version: &str) -> Result<WireModelVersion> {
        let resp: ModelVersionResponse = self
            .get(
                "model-versions/get",
                &[("name", model.to_string()), ("version", version.to_string())],
            )
            .await?;
        Ok(resp.model_version)
    }

    async fn create_run(
        &self,
        experiment_id: &str,
        child: &ChildEntity,
        run: &RunData,
    ) -> Result<CreatedChild> {
        let resp: RunResponse = self
            .post(
                "runs/create",
                &json!({
                    "experiment_id": experiment_id,
                    "run_name": run.run_name,
                    "start_time": run.start_time,
                    "user_id": run.user_id,
                    "tags": wire_tags(&child.tags),
                }),
            )
            .await?;
        let run_id = resp.run.info.run_id.clone();
        let timestamp = run.end_time.or(run.start_time).unwrap_or_default();
        let metrics: Vec<_> = run
            .metrics
            .iter()
            .map(|(key, value)| json!({"key": key, "value": value, "timestamp": timestamp, "step": 0}))
            .collect();
        let _: serde_json::Value = self
            .post(
                "runs/log-batch",
                &json!({
                    "run_id": run_id,
                    "params": wire_tags(&run.params),
                    "metrics": metrics,
                }),
            )
            .await?;
        if let Some(status) = &run.status {
            let _: serde_json::Value = self
                .post(
                    "runs/update",
                    &json!({"run_id": run_id, "status": status, "end_time": run.end_time}),
                )
                .await?;
        }
        Ok(CreatedChild {
            id: run_id,
            version: None,
            artifact_uri: resp.run.info.artifact_uri,
        })
    }

    async fn create_version(
        &self,
        model: &str,
        child: &ChildEntity,
        version: &VersionData,
    ) -> Result<CreatedChild> {
        let resp: ModelVersionResponse = self
            .post(
                "model-versions/create",
                &json!({
                    "name": model,
                    "source": version.source,
                    "run_id": version.run_id,
                    "description": version.description,
                    "tags": wire_tags(&child.tags),
                }),
            )
            .await?;
        let assigned = resp.model_version.version.parse::<u64>().map_err(|_| MigrateError::Store {
            message: format!(
                "registry returned non-numeric version '{}'",
                resp.model_version.version
            ),
            error_code: None,
        })?;
        Ok(CreatedChild {
            id: assigned.to_string(),
            version: Some(assigned),
            artifact_uri: None,
        })
    }
}

#[async_trait]
impl MetadataStore for RestStore {
    async fn get_parent(&self, kind: ParentKind, id_or_name: &str) -> Result<ParentEntity> {
        match kind {
            ParentKind::Experiment => match self.get_experiment_by_name(id_or_name).await {
                Err(e) if e.is_not_found() => self.get_experiment(id_or_name).await,
                other => other,
            },
            ParentKind::RegisteredModel => self.get_model(id_or_name).await,
        }
    }

    async fn find_parent_by_name(
        &self,
        kind: ParentKind,
        name: &str,
    ) -> Result<Option<ParentEntity>> {
        let found = match kind {
            ParentKind::Experiment => self.get_experiment_by_name(name).await,
            ParentKind::RegisteredModel => self.get_model(name).await,
        };
        match found {
            Ok(parent) => Ok(Some(parent)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_parents(
        &self,
        kind: ParentKind,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page<ParentEntity>> {
        match kind {
            ParentKind::Experiment => {
                let resp: SearchExperimentsResponse = self
                    .post(
                        "experiments/search",
                        &json!({"max_results": page_size, "page_token": cursor}),
                    )
                    .await?;
                Ok(Page {
                    items: resp.experiments.into_iter().map(Into::into).collect(),
                    next_cursor: non_empty(resp.next_page_token),
                })
            }
            ParentKind::RegisteredModel => {
                let mut query = vec![("max_results", page_size.to_string())];
                if let Some(token) = cursor {
                    query.push(("page_token", token.to_string()));
                }
                let resp: SearchModelsResponse =
                    self.get("registered-models/search", &query).await?;
                Ok(Page {
                    items: resp.registered_models.into_iter().map(Into::into).collect(),
                    next_cursor: non_empty(resp.next_page_token),
                })
            }
        }
    }

    async fn create_parent(
        &self,
        kind: ParentKind,
        name: &str,
        tags: &BTreeMap<String, String>,
        description: Option<&str>,
    ) -> Result<String> {
        match kind {
            ParentKind::Experiment => {
                let resp: CreateExperimentResponse = self
                    .post(
                        "experiments/create",
                        &json!({"name": name, "tags": wire_tags(tags)}),
                    )
                    .await?;
                Ok(resp.experiment_id)
            }
            ParentKind::RegisteredModel => {
                let resp: RegisteredModelResponse = self
                    .post(
                        "registered-models/create",
                        &json!({"name": name, "tags": wire_tags(tags), "description": description}),
                    )
                    .await?;
                Ok(resp.registered_model.name)
            }
        }
    }

    async fn delete_parent(&self, kind: ParentKind, id: &str) -> Result<()> {
        let _: serde_json::Value = match kind {
            ParentKind::Experiment => {
                self.post("experiments/delete", &json!({"experiment_id": id}))
                    .await?
            }
            ParentKind::RegisteredModel => {
                self.post("registered-models/delete", &json!({"name": id}))
                    .await?
            }
        };
        Ok(())
    }

    async fn list_children(
        &self,
        kind: ParentKind,
        parent_id: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page<ChildEntity>> {
        match kind {
            ParentKind::Experiment => {
                let resp: SearchRunsResponse = self
                    .post(
                        "runs/search",
                        &json!({
                            "experiment_ids": [parent_id],
                            "max_results": page_size,
                            "page_token": cursor,
                            "run_view_type": "ACTIVE_ONLY",
                        }),
                    )
                    .await?;
                Ok(Page {
                    items: resp.runs.into_iter().map(WireRun::into_child).collect(),
                    next_cursor: non_empty(resp.next_page_token),
                })
            }
            ParentKind::RegisteredModel => {
                let mut query = vec![
                    ("filter", format!("name='{}'", parent_id.replace('\'', "\\'"))),
                    ("max_results", page_size.to_string()),
                ];
                if let Some(token) = cursor {
                    query.push(("page_token", token.to_string()));
                }
                let resp: SearchVersionsResponse =
                    self.get("model-versions/search", &query).await?;
                let items = resp
                    .model_versions
                    .into_iter()
                    .map(WireModelVersion::into_child)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Page {
                    items,
                    next_cursor: non_empty(resp.next_page_token),
                })
            }
        }
    }

    async fn get_child(
        &self,
        kind: ParentKind,
        parent_id: &str,
        id: &str,
    ) -> Result<ChildEntity> {
        match kind {
            ParentKind::Experiment => {
                let resp: RunResponse = self.get("runs/get", &[("run_id", id.to_string())]).await?;
                Ok(resp.run.into_child())
            }
            ParentKind::RegisteredModel => self.get_version(parent_id, id).await?.into_child(),
        }
    }

    async fn create_child(
        &self,
        kind: ParentKind,
        parent_id: &str,
        child: &ChildEntity,
    ) -> Result<CreatedChild> {
        match (&child.payload, kind) {
            (ChildPayload::Run(run), ParentKind::Experiment) => {
                self.create_run(parent_id, child, run).await
            }
            (ChildPayload::Version(version), ParentKind::RegisteredModel) => {
                self.create_version(parent_id, child, version).await
            }
            _ => Err(MigrateError::config(format!(
                "child {} does not belong under a {}",
                child.id, kind
            ))),
        }
    }

    async fn set_tag(&self, entity: &EntityRef, key: &str, value: &str) -> Result<()> {
        let (endpoint, body) = match entity {
            EntityRef::Parent {
                kind: ParentKind::Experiment,
                id,
            } => (
                "experiments/set-experiment-tag",
                json!({"experiment_id": id, "key": key, "value": value}),
            ),
            EntityRef::Parent {
                kind: ParentKind::RegisteredModel,
                id,
            } => (
                "registered-models/set-tag",
                json!({"name": id, "key": key, "value": value}),
            ),
            EntityRef::Child {
                kind: ParentKind::Experiment,
                id,
                ..
            } => (
                "runs/set-tag",
                json!({"run_id": id, "key": key, "value": value}),
            ),
            EntityRef::Child {
                kind: ParentKind::RegisteredModel,
                parent_id,
                id,
            } => (
                "model-versions/set-tag",
                json!({"name": parent_id, "version": id, "key": key, "value": value}),
            ),
        };
        let _: serde_json::Value = self.post(endpoint, &body).await?;
        Ok(())
    }

    async fn transition_state(&self, entity: &EntityRef, target_state: &str) -> Result<()> {
        let EntityRef::Child {
            kind: ParentKind::RegisteredModel,
            parent_id,
            id,
        } = entity
        else {
            return Err(MigrateError::config(format!(
                "cannot transition {}: not a registry child",
                entity
            )));
        };
        let result: Result<serde_json::Value> = self
            .post(
                "model-versions/transition-stage",
                &json!({
                    "name": parent_id,
                    "version": id,
                    "stage": target_state,
                    "archive_existing_versions": false,
                }),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(MigrateError::Store { message, .. }) if message.contains(CURRENT_STAGE_MESSAGE) => {
                debug!("{} already in stage {}", entity, target_state);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn child_status(&self, entity: &EntityRef) -> Result<ChildStatus> {
        match entity {
            EntityRef::Child {
                kind: ParentKind::RegisteredModel,
                parent_id,
                id,
            } => {
                let version = self.get_version(parent_id, id).await?;
                Ok(match version.status.as_deref() {
                    Some("READY") | None => ChildStatus::Ready,
                    Some("FAILED_REGISTRATION") => ChildStatus::Failed,
                    Some(_) => ChildStatus::Pending,
                })
            }
            _ => Ok(ChildStatus::Ready),
        }
    }

    async fn locate_run(&self, run_id: &str) -> Result<Option<RunLocation>> {
        let run = match self
            .get::<RunResponse>("runs/get", &[("run_id", run_id.to_string())])
            .await
        {
            Ok(resp) => resp.run,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let experiment = self.get_experiment(&run.info.experiment_id).await?;
        Ok(Some(RunLocation {
            experiment_id: run.info.experiment_id,
            experiment_name: experiment.name,
            artifact_uri: run.info.artifact_uri,
        }))
    }
}

/// Decode a response body, mapping MLflow errors onto `MigrateError`.
async fn decode<R: DeserializeOwned>(response: Response, endpoint: &str) -> Result<R> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<R>().await?);
    }

    let body = response.text().await.unwrap_or_default();
    let api: ApiError = serde_json::from_str(&body).unwrap_or_default();
    let message = api.message.unwrap_or(body);

    Err(match api.error_code.as_deref() {
        Some("RESOURCE_ALREADY_EXISTS") => MigrateError::AlreadyExists {
            entity: endpoint.to_string(),
            name: message,
        },
        Some("RESOURCE_DOES_NOT_EXIST") => MigrateError::NotFound {
            entity: endpoint.to_string(),
            id: message,
        },
        _ if status == StatusCode::NOT_FOUND => MigrateError::NotFound {
            entity: endpoint.to_string(),
            id: message,
        },
        _ if is_retryable_status(status) => MigrateError::Transient {
            message: format!("{} returned {}: {}", endpoint, status, message),
            status: Some(status.as_u16()),
        },
        code => MigrateError::Store {
            message: format!("{} returned {}: {}", endpoint, status, message),
            error_code: code.map(str::to_string),
        },
    })
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
}

fn non_empty(token: Option<String>) -> Option<String> {
    token.filter(|t| !t.is_empty())
}

fn wire_tags(tags: &BTreeMap<String, String>) -> Vec<WireTag> {
    tags.iter()
        .map(|(key, value)| WireTag {
            key: key.clone(),
            value: value.clone(),
        })
        .collect()
}

fn tag_map(tags: Vec<WireTag>) -> BTreeMap<String, String> {
    tags.into_iter().map(|t| (t.key, t.value)).collect()
}

// Wire types

#[derive(Debug, Default, Deserialize)]
struct ApiError {
    error_code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireTag {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct WireExperiment {
    experiment_id: String,
    name: String,
    #[serde(default)]
    lifecycle_stage: Option<String>,
    #[serde(default)]
    creation_time: Option<i64>,
    #[serde(default)]
    last_update_time: Option<i64>,
    #[serde(default)]
    tags: Vec<WireTag>,
}

impl From<WireExperiment> for ParentEntity {
    fn from(exp: WireExperiment) -> Self {
        ParentEntity {
            id: exp.experiment_id,
            name: exp.name,
            tags: tag_map(exp.tags),
            description: None,
            lifecycle_stage: exp.lifecycle_stage,
            creation_time: exp.creation_time,
            last_update_time: exp.last_update_time,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExperimentResponse {
    experiment: WireExperiment,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct SearchExperimentsResponse {
    #[serde(default)]
    experiments: Vec<WireExperiment>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireRegisteredModel {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    creation_timestamp: Option<i64>,
    #[serde(default)]
    last_updated_timestamp: Option<i64>,
    #[serde(default)]
    tags: Vec<WireTag>,
}

impl From<WireRegisteredModel> for ParentEntity {
    fn from(model: WireRegisteredModel) -> Self {
        ParentEntity {
            id: model.name.clone(),
            name: model.name,
            tags: tag_map(model.tags),
            description: model.description,
            lifecycle_stage: None,
            creation_time: model.creation_timestamp,
            last_update_time: model.last_updated_timestamp,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegisteredModelResponse {
    registered_model: WireRegisteredModel,
}

#[derive(Debug, Deserialize)]
struct SearchModelsResponse {
    #[serde(default)]
    registered_models: Vec<WireRegisteredModel>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireRunInfo {
    run_id: String,
    experiment_id: String,
    #[serde(default)]
    run_name: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    start_time: Option<i64>,
    #[serde(default)]
    end_time: Option<i64>,
    #[serde(default)]
    artifact_uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMetric {
    key: String,
    value: f64,
}

#[derive(Debug, Default, Deserialize)]
struct WireRunData {
    #[serde(default)]
    metrics: Vec<WireMetric>,
    #[serde(default)]
    params: Vec<WireTag>,
    #[serde(default)]
    tags: Vec<WireTag>,
}

#[derive(Debug, Deserialize)]
struct WireRun {
    info: WireRunInfo,
    #[serde(default)]
    data: WireRunData,
}

impl WireRun {
    fn into_child(self) -> ChildEntity {
        let info = self.info;
        let data = RunData {
            run_name: info.run_name,
            status: info.status,
            user_id: info.user_id,
            start_time: info.start_time,
            end_time: info.end_time,
            artifact_uri: info.artifact_uri,
            params: tag_map(self.data.params),
            metrics: self
                .data
                .metrics
                .into_iter()
                .map(|m| (m.key, m.value))
                .collect(),
        };
        let mut child = ChildEntity::run(info.run_id, info.experiment_id, data);
        child.tags = tag_map(self.data.tags);
        child
    }
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    run: WireRun,
}

#[derive(Debug, Deserialize)]
struct SearchRunsResponse {
    #[serde(default)]
    runs: Vec<WireRun>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireModelVersion {
    name: String,
    version: String,
    #[serde(default)]
    current_stage: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    source: String,
    #[serde(default)]
    run_id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    tags: Vec<WireTag>,
}

impl WireModelVersion {
    fn into_child(self) -> Result<ChildEntity> {
        let number = self.version.parse::<u64>().map_err(|_| MigrateError::Store {
            message: format!("non-numeric version '{}' for model {}", self.version, self.name),
            error_code: None,
        })?;
        let mut data = VersionData::new(number, self.run_id, self.source);
        if let Some(stage) = self.current_stage {
            data.current_stage = stage;
        }
        data.description = self.description;
        data.user_id = self.user_id;
        data.status = self.status;
        let mut child = ChildEntity::version(self.name, data);
        child.tags = tag_map(self.tags);
        Ok(child)
    }
}

#[derive(Debug, Deserialize)]
struct ModelVersionResponse {
    model_version: WireModelVersion,
}

#[derive(Debug, Deserialize)]
struct SearchVersionsResponse {
    #[serde(default)]
    model_versions: Vec<WireModelVersion>,
    next_page_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_under_api_prefix() {
        let store = RestStore::new("http://localhost:5000", None).unwrap();
        assert_eq!(
            store.endpoint("runs/search").unwrap().as_str(),
            "http://localhost:5000/api/2.0/mlflow/runs/search"
        );

        let store = RestStore::new("https://example.com/mlflow", None).unwrap();
        assert_eq!(
            store.endpoint("experiments/get").unwrap().as_str(),
            "https://example.com/mlflow/api/2.0/mlflow/experiments/get"
        );
    }

    #[test]
    fn test_invalid_host_is_config_error() {
        let err = RestStore::new("not a url", None).err().unwrap();
        assert!(matches!(err, MigrateError::Config { .. }));
    }

    #[test]
    fn test_wire_run_conversion() {
        let run: WireRun = serde_json::from_value(json!({
            "info": {"run_id": "r1", "experiment_id": "7", "status": "FINISHED",
                     "artifact_uri": "s3://b/7/r1/artifacts"},
            "data": {"metrics": [{"key": "rmse", "value": 0.5, "timestamp": 1, "step": 0}],
                     "params": [{"key": "alpha", "value": "0.1"}],
                     "tags": [{"key": "team", "value": "ml"}]}
        }))
        .unwrap();
        let child = run.into_child();
        assert_eq!(child.id, "r1");
        assert_eq!(child.parent_id, "7");
        assert_eq!(child.tags.get("team").map(String::as_str), Some("ml"));
        match child.payload {
            ChildPayload::Run(data) => {
                assert_eq!(data.metrics.get("rmse"), Some(&0.5));
                assert_eq!(data.params.get("alpha").map(String::as_str), Some("0.1"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_wire_version_rejects_non_numeric() {
        let version: WireModelVersion = serde_json::from_value(json!({
            "name": "churn", "version": "latest", "source": "s3://x", "run_id": "r1"
        }))
        .unwrap();
        assert!(version.into_child().is_err());
    }
}

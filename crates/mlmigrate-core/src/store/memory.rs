//! In-process metadata store.
//!
//! Mirrors the behavior the engine relies on from a real tracking server: name
//! uniqueness for parents, contiguous version numbering per registered model, stable
//! offset-based pagination. Faults can be injected per child to exercise retry and
//! isolation paths, and every mutating call is recorded.

use super::types::{
    ChildEntity, ChildPayload, ChildStatus, CreatedChild, EntityRef, Page, ParentEntity,
    ParentKind, RunLocation,
};
use super::MetadataStore;
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Record of calls observed by a [`MemoryStore`].
#[derive(Debug, Clone, Default)]
pub struct StoreCalls {
    pub create_parent: usize,
    pub delete_parent: usize,
    pub create_child: usize,
    pub get_child: usize,
    pub list_children: usize,
    pub transition_state: usize,
    /// Source IDs of children successfully created, in call order.
    pub created_children: Vec<String>,
    /// Destination-assigned version numbers, in call order.
    pub created_versions: Vec<u64>,
    /// Child IDs returned by `list_children`, in listing order.
    pub listed_children: Vec<String>,
    /// Cursor passed to each `list_children` call.
    pub list_cursors: Vec<Option<String>>,
}

#[derive(Debug, Default)]
struct Faults {
    /// Remaining transient failures per child ID.
    transient: HashMap<String, u32>,
    /// Child IDs that always fail with `NotFound`.
    permanent: HashSet<String>,
    /// Remaining transient failures per listing cursor ("" = first page).
    list_transient: HashMap<String, u32>,
    /// Extra numbers the registry skips before assigning the next version.
    version_skew: HashMap<String, u64>,
    /// Number of `Pending` answers each new version gives before turning ready.
    pending_polls: u32,
}

#[derive(Debug, Default)]
struct State {
    experiments: BTreeMap<String, ParentEntity>,
    models: BTreeMap<String, ParentEntity>,
    runs: BTreeMap<String, Vec<ChildEntity>>,
    versions: BTreeMap<String, Vec<ChildEntity>>,
    pending: HashMap<(String, String), u32>,
    next_id: u64,
    faults: Faults,
    calls: StoreCalls,
}

impl State {
    fn parents(&self, kind: ParentKind) -> &BTreeMap<String, ParentEntity> {
        match kind {
            ParentKind::Experiment => &self.experiments,
            ParentKind::RegisteredModel => &self.models,
        }
    }

    fn parents_mut(&mut self, kind: ParentKind) -> &mut BTreeMap<String, ParentEntity> {
        match kind {
            ParentKind::Experiment => &mut self.experiments,
            ParentKind::RegisteredModel => &mut self.models,
        }
    }

    fn children(&self, kind: ParentKind) -> &BTreeMap<String, Vec<ChildEntity>> {
        match kind {
            ParentKind::Experiment => &self.runs,
            ParentKind::RegisteredModel => &self.versions,
        }
    }

    fn children_mut(&mut self, kind: ParentKind) -> &mut BTreeMap<String, Vec<ChildEntity>> {
        match kind {
            ParentKind::Experiment => &mut self.runs,
            ParentKind::RegisteredModel => &mut self.versions,
        }
    }

    fn next_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    /// Apply injected faults for a child operation.
    fn check_faults(&mut self, child_id: &str, entity: &str) -> Result<()> {
        if self.faults.permanent.contains(child_id) {
            return Err(MigrateError::not_found(entity, child_id));
        }
        if let Some(remaining) = self.faults.transient.get_mut(child_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MigrateError::Transient {
                    message: format!("injected failure for {} {}", entity, child_id),
                    status: Some(503),
                });
            }
        }
        Ok(())
    }

    fn find_child_mut(
        &mut self,
        kind: ParentKind,
        parent_id: &str,
        id: &str,
    ) -> Result<&mut ChildEntity> {
        self.children_mut(kind)
            .get_mut(parent_id)
            .and_then(|children| children.iter_mut().find(|c| c.id == id))
            .ok_or_else(|| MigrateError::not_found(kind.child_entity(), id))
    }
}

/// In-process [`MetadataStore`].
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store. `name` appears in artifact URIs.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a parent as-is.
    pub fn insert_parent(&self, kind: ParentKind, parent: ParentEntity) {
        let mut state = self.state();
        state.children_mut(kind).entry(parent.id.clone()).or_default();
        state.parents_mut(kind).insert(parent.id.clone(), parent);
    }

    /// Seed a child as-is, appended to its parent's listing order.
    pub fn insert_child(&self, kind: ParentKind, child: ChildEntity) {
        self.state()
            .children_mut(kind)
            .entry(child.parent_id.clone())
            .or_default()
            .push(child);
    }

    pub fn parents(&self, kind: ParentKind) -> Vec<ParentEntity> {
        self.state().parents(kind).values().cloned().collect()
    }

    pub fn children(&self, kind: ParentKind, parent_id: &str) -> Vec<ChildEntity> {
        self.state()
            .children(kind)
            .get(parent_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> StoreCalls {
        self.state().calls.clone()
    }

    /// Make operations on `child_id` fail transiently `times` times.
    pub fn fail_transiently(&self, child_id: impl Into<String>, times: u32) {
        self.state().faults.transient.insert(child_id.into(), times);
    }

    /// Make operations on `child_id` fail with `NotFound` until cleared.
    pub fn fail_permanently(&self, child_id: impl Into<String>) {
        self.state().faults.permanent.insert(child_id.into());
    }

    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.faults.transient.clear();
        state.faults.permanent.clear();
        state.faults.list_transient.clear();
    }

    /// Make the listing page at `cursor` fail transiently `times` times.
    pub fn fail_listing(&self, cursor: Option<&str>, times: u32) {
        self.state()
            .faults
            .list_transient
            .insert(cursor.unwrap_or_default().to_string(), times);
    }

    /// Make the registry skip `extra` numbers before assigning the next version of
    /// `model`, as a concurrent external writer would.
    pub fn skew_next_version(&self, model: impl Into<String>, extra: u64) {
        self.state().faults.version_skew.insert(model.into(), extra);
    }

    /// New versions report `Pending` this many times before becoming ready.
    pub fn set_pending_polls(&self, polls: u32) {
        self.state().faults.pending_polls = polls;
    }

    fn parse_cursor(cursor: Option<&str>) -> Result<usize> {
        match cursor {
            None => Ok(0),
            Some(c) => c
                .parse()
                .map_err(|_| MigrateError::config(format!("invalid cursor '{}'", c))),
        }
    }

    fn paginate<T: Clone>(items: &[T], offset: usize, page_size: usize) -> Page<T> {
        let end = (offset + page_size.max(1)).min(items.len());
        let page = items.get(offset..end).unwrap_or_default().to_vec();
        let next_cursor = (end < items.len()).then(|| end.to_string());
        Page {
            items: page,
            next_cursor,
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get_parent(&self, kind: ParentKind, id_or_name: &str) -> Result<ParentEntity> {
        let state = self.state();
        let parents = state.parents(kind);
        parents
            .get(id_or_name)
            .or_else(|| parents.values().find(|p| p.name == id_or_name))
            .cloned()
            .ok_or_else(|| MigrateError::not_found(kind.as_str(), id_or_name))
    }

    async fn find_parent_by_name(
        &self,
        kind: ParentKind,
        name: &str,
    ) -> Result<Option<ParentEntity>> {
        Ok(self
            .state()
            .parents(kind)
            .values()
            .find(|p| p.name == name)
            .cloned())
    }

    async fn list_parents(
        &self,
        kind: ParentKind,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page<ParentEntity>> {
        let offset = Self::parse_cursor(cursor)?;
        let state = self.state();
        let all: Vec<ParentEntity> = state.parents(kind).values().cloned().collect();
        Ok(Self::paginate(&all, offset, page_size))
    }

    async fn create_parent(
        &self,
        kind: ParentKind,
        name: &str,
        tags: &BTreeMap<String, String>,
        description: Option<&str>,
    ) -> Result<String> {
        let mut state = self.state();
        state.calls.create_parent += 1;
        if state.parents(kind).values().any(|p| p.name == name) {
            return Err(MigrateError::AlreadyExists {
                entity: kind.as_str().to_string(),
                name: name.to_string(),
            });
        }
        let id = match kind {
            ParentKind::Experiment => state.next_id(),
            ParentKind::RegisteredModel => name.to_string(),
        };
        let mut parent = ParentEntity::new(id.clone(), name);
        parent.tags = tags.clone();
        parent.description = description.map(str::to_string);
        state.parents_mut(kind).insert(id.clone(), parent);
        state.children_mut(kind).entry(id.clone()).or_default();
        Ok(id)
    }

    async fn delete_parent(&self, kind: ParentKind, id: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.delete_parent += 1;
        if state.parents_mut(kind).remove(id).is_none() {
            return Err(MigrateError::not_found(kind.as_str(), id));
        }
        state.children_mut(kind).remove(id);
        Ok(())
    }

    async fn list_children(
        &self,
        kind: ParentKind,
        parent_id: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page<ChildEntity>> {
        let offset = Self::parse_cursor(cursor)?;
        let mut state = self.state();
        state.calls.list_children += 1;
        state.calls.list_cursors.push(cursor.map(str::to_string));

        let key = cursor.unwrap_or_default().to_string();
        if let Some(remaining) = state.faults.list_transient.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MigrateError::transient(format!(
                    "injected listing failure at cursor '{}'",
                    key
                )));
            }
        }

        let children = state
            .children(kind)
            .get(parent_id)
            .ok_or_else(|| MigrateError::not_found(kind.as_str(), parent_id))?;
        let page = Self::paginate(children, offset, page_size);
        let listed: Vec<String> = page.items.iter().map(|c| c.id.clone()).collect();
        state.calls.listed_children.extend(listed);
        Ok(page)
    }

    async fn get_child(
        &self,
        kind: ParentKind,
        parent_id: &str,
        id: &str,
    ) -> Result<ChildEntity> {
        let mut state = self.state();
        state.calls.get_child += 1;
        state.check_faults(id, kind.child_entity())?;
        state
            .children(kind)
            .get(parent_id)
            .and_then(|children| children.iter().find(|c| c.id == id))
            .cloned()
            .ok_or_else(|| MigrateError::not_found(kind.child_entity(), id))
    }

    async fn create_child(
        &self,
        kind: ParentKind,
        parent_id: &str,
        child: &ChildEntity,
    ) -> Result<CreatedChild> {
        let mut state = self.state();
        state.calls.create_child += 1;
        state.check_faults(&child.id, kind.child_entity())?;
        if !state.parents(kind).contains_key(parent_id) {
            return Err(MigrateError::not_found(kind.as_str(), parent_id));
        }

        let mut created = child.clone();
        created.parent_id = parent_id.to_string();
        let result = match &mut created.payload {
            ChildPayload::Run(run) => {
                let id = uuid::Uuid::new_v4().simple().to_string();
                let artifact_uri = format!("memory://{}/{}/{}/artifacts", self.name, parent_id, id);
                run.artifact_uri = Some(artifact_uri.clone());
                created.id = id.clone();
                CreatedChild {
                    id,
                    version: None,
                    artifact_uri: Some(artifact_uri),
                }
            }
            ChildPayload::Version(version) => {
                let skew = state
                    .faults
                    .version_skew
                    .remove(parent_id)
                    .unwrap_or_default();
                let highest = state
                    .versions
                    .get(parent_id)
                    .and_then(|versions| {
                        versions
                            .iter()
                            .filter_map(|v| v.as_version().map(|d| d.version))
                            .max()
                    })
                    .unwrap_or_default();
                let assigned = highest + 1 + skew;
                version.version = assigned;
                version.status = Some("READY".to_string());
                created.id = assigned.to_string();
                state.calls.created_versions.push(assigned);
                CreatedChild {
                    id: assigned.to_string(),
                    version: Some(assigned),
                    artifact_uri: None,
                }
            }
        };

        let pending_polls = state.faults.pending_polls;
        if pending_polls > 0 {
            state
                .pending
                .insert((parent_id.to_string(), created.id.clone()), pending_polls);
        }
        state.calls.created_children.push(child.id.clone());
        state
            .children_mut(kind)
            .entry(parent_id.to_string())
            .or_default()
            .push(created);
        Ok(result)
    }

    async fn set_tag(&self, entity: &EntityRef, key: &str, value: &str) -> Result<()> {
        let mut state = self.state();
        match entity {
            EntityRef::Parent { kind, id } => {
                let parent = state
                    .parents_mut(*kind)
                    .get_mut(id)
                    .ok_or_else(|| MigrateError::not_found(kind.as_str(), id.as_str()))?;
                parent.tags.insert(key.to_string(), value.to_string());
            }
            EntityRef::Child {
                kind,
                parent_id,
                id,
            } => {
                let child = state.find_child_mut(*kind, parent_id, id)?;
                child.tags.insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    async fn transition_state(&self, entity: &EntityRef, target_state: &str) -> Result<()> {
        let EntityRef::Child {
            kind,
            parent_id,
            id,
        } = entity
        else {
            return Err(MigrateError::config(format!(
                "cannot transition {}: not a registry child",
                entity
            )));
        };
        let mut state = self.state();
        state.calls.transition_state += 1;
        let child = state.find_child_mut(*kind, parent_id, id)?;
        match child.as_version_mut() {
            Some(version) => {
                version.current_stage = target_state.to_string();
                Ok(())
            }
            None => Err(MigrateError::config(format!(
                "cannot transition {}: not a registry child",
                entity
            ))),
        }
    }

    async fn child_status(&self, entity: &EntityRef) -> Result<ChildStatus> {
        let EntityRef::Child { parent_id, id, .. } = entity else {
            return Ok(ChildStatus::Ready);
        };
        let mut state = self.state();
        let key = (parent_id.clone(), id.clone());
        match state.pending.get_mut(&key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Ok(ChildStatus::Pending)
            }
            _ => Ok(ChildStatus::Ready),
        }
    }

    async fn locate_run(&self, run_id: &str) -> Result<Option<RunLocation>> {
        let state = self.state();
        for (experiment_id, runs) in &state.runs {
            let Some(run) = runs.iter().find(|r| r.id == run_id) else {
                continue;
            };
            let experiment_name = state
                .experiments
                .get(experiment_id)
                .map(|e| e.name.clone())
                .unwrap_or_default();
            let artifact_uri = match &run.payload {
                ChildPayload::Run(data) => data.artifact_uri.clone(),
                ChildPayload::Version(_) => None,
            };
            return Ok(Some(RunLocation {
                experiment_id: experiment_id.clone(),
                experiment_name,
                artifact_uri,
            }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::{RunData, VersionData};

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new("src");
        store.insert_parent(ParentKind::Experiment, ParentEntity::new("1", "exp-A"));
        for id in ["r1", "r2", "r3", "r4", "r5"] {
            store.insert_child(
                ParentKind::Experiment,
                ChildEntity::run(id, "1", RunData::default()),
            );
        }
        store
    }

    #[tokio::test]
    async fn test_pagination_is_stable() {
        let store = seeded();
        let first = store
            .list_children(ParentKind::Experiment, "1", None, 2)
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.next_cursor.clone();
        assert!(cursor.is_some());

        let again = store
            .list_children(ParentKind::Experiment, "1", cursor.as_deref(), 2)
            .await
            .unwrap();
        let twice = store
            .list_children(ParentKind::Experiment, "1", cursor.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(again, twice);
        assert_eq!(again.items[0].id, "r3");
    }

    #[tokio::test]
    async fn test_last_page_has_no_cursor() {
        let store = seeded();
        let page = store
            .list_children(ParentKind::Experiment, "1", Some("4"), 2)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_create_parent_rejects_duplicate_name() {
        let store = MemoryStore::new("dst");
        let tags = BTreeMap::new();
        store
            .create_parent(ParentKind::Experiment, "exp-A", &tags, None)
            .await
            .unwrap();
        let err = store
            .create_parent(ParentKind::Experiment, "exp-A", &tags, None)
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_versions_are_contiguous_unless_skewed() {
        let store = MemoryStore::new("dst");
        store
            .create_parent(ParentKind::RegisteredModel, "churn", &BTreeMap::new(), None)
            .await
            .unwrap();
        let child = ChildEntity::version("churn", VersionData::new(9, "r1", "s3://b/r1/model"));

        let first = store
            .create_child(ParentKind::RegisteredModel, "churn", &child)
            .await
            .unwrap();
        assert_eq!(first.version, Some(1));

        store.skew_next_version("churn", 1);
        let second = store
            .create_child(ParentKind::RegisteredModel, "churn", &child)
            .await
            .unwrap();
        assert_eq!(second.version, Some(3));
    }

    #[tokio::test]
    async fn test_injected_transient_failure_clears() {
        let store = seeded();
        store.fail_transiently("r2", 1);
        let err = store
            .get_child(ParentKind::Experiment, "1", "r2")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(store
            .get_child(ParentKind::Experiment, "1", "r2")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_transition_to_current_stage_is_noop() {
        let store = MemoryStore::new("dst");
        store.insert_parent(ParentKind::RegisteredModel, ParentEntity::new("churn", "churn"));
        store.insert_child(
            ParentKind::RegisteredModel,
            ChildEntity::version(
                "churn",
                VersionData::new(1, "r1", "s3://b/r1/model").with_stage("Production"),
            ),
        );
        let entity = EntityRef::child(ParentKind::RegisteredModel, "churn", "1");
        store.transition_state(&entity, "Production").await.unwrap();
        store.transition_state(&entity, "Production").await.unwrap();
    }
}

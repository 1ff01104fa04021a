//! Metadata store seam.
//!
//! The engine talks to both the source and the destination through [`MetadataStore`].
//! Two implementations ship with the crate:
//! - [`MemoryStore`]: in-process store with fault injection, for tests and dry runs
//! - [`RestStore`]: MLflow REST API 2.0 client

mod memory;
mod rest;
mod types;

pub use memory::{MemoryStore, StoreCalls};
pub use rest::RestStore;
pub use types::{
    ChildEntity, ChildPayload, ChildStatus, CreatedChild, EntityRef, Page, ParentEntity,
    ParentKind, RunData, RunLocation, VersionData, STAGE_ARCHIVED, STAGE_NONE,
};

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Operations the migration engine needs from a metadata store.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Fetch a parent by ID, falling back to lookup by name.
    ///
    /// Fails with `NotFound` if neither matches.
    async fn get_parent(&self, kind: ParentKind, id_or_name: &str) -> Result<ParentEntity>;

    /// Look a parent up by exact name.
    async fn find_parent_by_name(&self, kind: ParentKind, name: &str)
        -> Result<Option<ParentEntity>>;

    /// List parents of a kind, page by page.
    async fn list_parents(
        &self,
        kind: ParentKind,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page<ParentEntity>>;

    /// Create a parent and return its ID.
    ///
    /// Fails with `AlreadyExists` if a parent with that name exists.
    async fn create_parent(
        &self,
        kind: ParentKind,
        name: &str,
        tags: &BTreeMap<String, String>,
        description: Option<&str>,
    ) -> Result<String>;

    /// Delete a parent and all of its children.
    async fn delete_parent(&self, kind: ParentKind, id: &str) -> Result<()>;

    /// List the children of a parent, page by page.
    ///
    /// A `None` cursor starts from the beginning. Page contents are stable for a given
    /// cursor while the source is not modified.
    async fn list_children(
        &self,
        kind: ParentKind,
        parent_id: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<Page<ChildEntity>>;

    async fn get_child(&self, kind: ParentKind, parent_id: &str, id: &str)
        -> Result<ChildEntity>;

    /// Create a child under `parent_id`.
    ///
    /// Registry children carry the destination-assigned sequence number in the result.
    async fn create_child(
        &self,
        kind: ParentKind,
        parent_id: &str,
        child: &ChildEntity,
    ) -> Result<CreatedChild>;

    async fn set_tag(&self, entity: &EntityRef, key: &str, value: &str) -> Result<()>;

    /// Move a registry child to `target_state`.
    ///
    /// A child already in the target state is a no-op, not an error.
    async fn transition_state(&self, entity: &EntityRef, target_state: &str) -> Result<()>;

    async fn child_status(&self, entity: &EntityRef) -> Result<ChildStatus>;

    /// Find the experiment and artifact root of a run, `None` if the run is unknown.
    async fn locate_run(&self, run_id: &str) -> Result<Option<RunLocation>>;
}

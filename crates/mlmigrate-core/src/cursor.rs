//! Resumable page-by-page listing over a metadata store.
//!
//! A cursor remembers the token of the next page to fetch. Fetch failures never
//! advance it, so retrying `next_page` asks for the same page again. Any token
//! previously reported by [`ChildCursor::position`] can seed a new cursor.

use crate::error::{MigrateError, Result};
use crate::retry::{retry_async, RetryPolicy};
use crate::store::{ChildEntity, MetadataStore, Page, ParentEntity, ParentKind};
use std::sync::Arc;
use tracing::debug;

/// One fetched page with the tokens around it.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorPage<T> {
    pub items: Vec<T>,
    /// Token that fetches this page again (`None` = first page).
    pub start: Option<String>,
    /// Token of the following page, `None` on the last page.
    pub next: Option<String>,
}

#[derive(Debug, Clone)]
struct CursorState {
    position: Option<String>,
    exhausted: bool,
    page_size: usize,
    pages_fetched: usize,
}

impl CursorState {
    fn new(page_size: usize) -> Self {
        Self {
            position: None,
            exhausted: false,
            page_size: page_size.max(1),
            pages_fetched: 0,
        }
    }

    fn advance<T>(&mut self, start: Option<String>, page: Page<T>) -> CursorPage<T> {
        self.pages_fetched += 1;
        match &page.next_cursor {
            Some(next) => self.position = Some(next.clone()),
            None => self.exhausted = true,
        }
        CursorPage {
            items: page.items,
            start,
            next: page.next_cursor,
        }
    }
}

/// Lazy listing of the children of one parent.
pub struct ChildCursor {
    store: Arc<dyn MetadataStore>,
    kind: ParentKind,
    parent_id: String,
    state: CursorState,
}

impl ChildCursor {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        kind: ParentKind,
        parent_id: impl Into<String>,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            kind,
            parent_id: parent_id.into(),
            state: CursorState::new(page_size),
        }
    }

    /// Start from a previously reported position instead of the first page.
    pub fn resume_from(mut self, position: Option<String>) -> Self {
        if position.is_some() {
            debug!(
                "Resuming {} listing of {} at cursor {:?}",
                self.kind.child_entity(),
                self.parent_id,
                position
            );
        }
        self.state.position = position;
        self
    }

    /// Token of the next page to fetch.
    pub fn position(&self) -> Option<&str> {
        self.state.position.as_deref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.state.exhausted
    }

    pub fn pages_fetched(&self) -> usize {
        self.state.pages_fetched
    }

    async fn fetch(&self, cursor: Option<&str>) -> Result<Page<ChildEntity>> {
        self.store
            .list_children(self.kind, &self.parent_id, cursor, self.state.page_size)
            .await
    }

    /// Fetch the next page. `Ok(None)` once the listing is exhausted.
    ///
    /// Errors, transient or not, are returned as-is and leave the position unchanged.
    pub async fn next_page(&mut self) -> Result<Option<CursorPage<ChildEntity>>> {
        if self.state.exhausted {
            return Ok(None);
        }
        let start = self.state.position.clone();
        let page = self.fetch(start.as_deref()).await?;
        Ok(Some(self.state.advance(start, page)))
    }

    /// [`next_page`](Self::next_page), re-fetching the same page on transient errors.
    pub async fn next_page_retrying(
        &mut self,
        policy: &RetryPolicy,
    ) -> Result<Option<CursorPage<ChildEntity>>> {
        if self.state.exhausted {
            return Ok(None);
        }
        let start = self.state.position.clone();
        let this = &*self;
        let cursor = start.as_deref();
        let (result, _) = retry_async(
            policy,
            move || this.fetch(cursor),
            MigrateError::is_retryable,
        )
        .await;
        let page = result?;
        Ok(Some(self.state.advance(start, page)))
    }
}

/// Lazy listing of all parents of a kind.
pub struct ParentCursor {
    store: Arc<dyn MetadataStore>,
    kind: ParentKind,
    state: CursorState,
}

impl ParentCursor {
    pub fn new(store: Arc<dyn MetadataStore>, kind: ParentKind, page_size: usize) -> Self {
        Self {
            store,
            kind,
            state: CursorState::new(page_size),
        }
    }

    pub fn position(&self) -> Option<&str> {
        self.state.position.as_deref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.state.exhausted
    }

    async fn fetch(&self, cursor: Option<&str>) -> Result<Page<ParentEntity>> {
        self.store
            .list_parents(self.kind, cursor, self.state.page_size)
            .await
    }

    pub async fn next_page_retrying(
        &mut self,
        policy: &RetryPolicy,
    ) -> Result<Option<CursorPage<ParentEntity>>> {
        if self.state.exhausted {
            return Ok(None);
        }
        let start = self.state.position.clone();
        let this = &*self;
        let cursor = start.as_deref();
        let (result, _) = retry_async(
            policy,
            move || this.fetch(cursor),
            MigrateError::is_retryable,
        )
        .await;
        let page = result?;
        Ok(Some(self.state.advance(start, page)))
    }

    /// Drain the whole listing.
    pub async fn collect_all(mut self, policy: &RetryPolicy) -> Result<Vec<ParentEntity>> {
        let mut parents = Vec::new();
        while let Some(page) = self.next_page_retrying(policy).await? {
            parents.extend(page.items);
        }
        Ok(parents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, RunData};
    use std::time::Duration;

    fn five_runs() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new("src"));
        store.insert_parent(ParentKind::Experiment, ParentEntity::new("1", "exp-A"));
        for i in 1..=5 {
            store.insert_child(
                ParentKind::Experiment,
                ChildEntity::run(format!("r{}", i), "1", RunData::default()),
            );
        }
        store
    }

    fn ids(page: &CursorPage<ChildEntity>) -> Vec<&str> {
        page.items.iter().map(|c| c.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_walks_all_pages() {
        let store = five_runs();
        let mut cursor = ChildCursor::new(store, ParentKind::Experiment, "1", 2);

        let first = cursor.next_page().await.unwrap().unwrap();
        assert_eq!(ids(&first), vec!["r1", "r2"]);
        assert_eq!(first.start, None);
        assert_eq!(cursor.position(), Some("2"));

        let second = cursor.next_page().await.unwrap().unwrap();
        assert_eq!(second.start.as_deref(), Some("2"));
        let third = cursor.next_page().await.unwrap().unwrap();
        assert_eq!(ids(&third), vec!["r5"]);
        assert!(third.next.is_none());
        assert!(cursor.is_exhausted());
        assert!(cursor.next_page().await.unwrap().is_none());
        assert_eq!(cursor.pages_fetched(), 3);
    }

    #[tokio::test]
    async fn test_resume_skips_consumed_pages() {
        let store = five_runs();
        let mut cursor = ChildCursor::new(store.clone(), ParentKind::Experiment, "1", 2)
            .resume_from(Some("2".to_string()));

        let mut seen = Vec::new();
        while let Some(page) = cursor.next_page().await.unwrap() {
            seen.extend(page.items.into_iter().map(|c| c.id));
        }
        assert_eq!(seen, vec!["r3", "r4", "r5"]);
        assert!(!store.calls().listed_children.contains(&"r1".to_string()));
    }

    #[tokio::test]
    async fn test_transient_failure_does_not_advance() {
        let store = five_runs();
        store.fail_listing(Some("2"), 1);
        let mut cursor = ChildCursor::new(store, ParentKind::Experiment, "1", 2)
            .resume_from(Some("2".to_string()));

        let err = cursor.next_page().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(cursor.position(), Some("2"));

        let page = cursor.next_page().await.unwrap().unwrap();
        assert_eq!(ids(&page), vec!["r3", "r4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrying_fetch() {
        let store = five_runs();
        store.fail_listing(None, 2);
        let mut cursor = ChildCursor::new(store, ParentKind::Experiment, "1", 10);
        let policy = RetryPolicy::new(3, Duration::from_secs(1));

        let page = cursor.next_page_retrying(&policy).await.unwrap().unwrap();
        assert_eq!(page.items.len(), 5);
        assert!(cursor.is_exhausted());
    }

    #[tokio::test]
    async fn test_parent_listing() {
        let store = Arc::new(MemoryStore::new("src"));
        for i in 1..=3 {
            store.insert_parent(
                ParentKind::RegisteredModel,
                ParentEntity::new(format!("m{}", i), format!("m{}", i)),
            );
        }
        let parents = ParentCursor::new(store, ParentKind::RegisteredModel, 2)
            .collect_all(&RetryPolicy::none())
            .await
            .unwrap();
        assert_eq!(parents.len(), 3);
    }
}

use crate::errors::Result;
use crate::models::{EntityId, ResyncRecord};
use crate::source::{OwnerSource, RelationSource};
use std::sync::Arc;

/// Walks owner ids page by page, advancing by the last id seen.
pub struct ChunkPaginator {
    source: Arc<dyn OwnerSource>,
    page_size: usize,
    cursor: Option<EntityId>,
    exhausted: bool,
}

impl ChunkPaginator {
    pub fn new(source: Arc<dyn OwnerSource>, page_size: usize) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
            cursor: None,
            exhausted: false,
        }
    }

    /// Next non-empty page, or `None` once the source is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<EntityId>>> {
        if self.exhausted {
            return Ok(None);
        }
        let page = self.source.owner_page(self.cursor, self.page_size).await?;
        match page.last() {
            None => {
                self.exhausted = true;
                Ok(None)
            }
            Some(&last) => {
                self.cursor = Some(last);
                if page.len() < self.page_size {
                    self.exhausted = true;
                }
                Ok(Some(page))
            }
        }
    }

    pub fn cursor(&self) -> Option<EntityId> {
        self.cursor
    }
}

/// Turns a page of owner ids into resync records.
pub struct RelationshipResolver {
    source: Arc<dyn RelationSource>,
}

impl RelationshipResolver {
    pub fn new(source: Arc<dyn RelationSource>) -> Self {
        Self { source }
    }

    /// One record per owner, in page order. Owners whose set is empty are left
    /// out and counted in the second return value.
    pub async fn resolve(&self, owner_ids: &[EntityId]) -> Result<(Vec<ResyncRecord>, u64)> {
        let mut relations = self.source.relations_of(owner_ids).await?;
        let mut records = Vec::with_capacity(owner_ids.len());
        let mut skipped = 0u64;
        for &owner_id in owner_ids {
            match relations.remove(&owner_id) {
                Some(related_ids) if !related_ids.is_empty() => {
                    records.push(ResyncRecord::new(owner_id, related_ids));
                }
                _ => skipped += 1,
            }
        }
        Ok((records, skipped))
    }
}

//! In-memory face index of completed photos.
//!
//! A sharded map keyed by photo id. A worker reserves a slot for its photo,
//! persists the face set with no index lock held, then publishes it only if
//! the slot is still the one it reserved. Deletion and re-queue remove the
//! slot while their database change runs, so a face set persisted before
//! either of them can never become visible afterwards.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::db::{Database, StoredFace};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct IndexedFace {
    pub face_index: u32,
    pub embedding: Vec<f32>,
}

/// A committed face set; replaced wholesale, never edited in place.
#[derive(Debug, Clone)]
pub struct IndexedPhoto {
    pub photo_id: i64,
    pub event_id: i64,
    pub created_at: DateTime<Utc>,
    pub faces: Vec<IndexedFace>,
}

impl IndexedPhoto {
    pub fn from_stored(
        photo_id: i64,
        event_id: i64,
        created_at: DateTime<Utc>,
        faces: &[StoredFace],
    ) -> Self {
        Self {
            photo_id,
            event_id,
            created_at,
            faces: faces
                .iter()
                .map(|f| IndexedFace {
                    face_index: f.face_index,
                    embedding: f.embedding.clone(),
                })
                .collect(),
        }
    }
}

/// What happened when a worker tried to publish a face set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Published,
    /// The photo was deleted or re-queued while its encode was in flight
    Discarded,
}

struct Slot {
    /// Changes on every reservation; a publish must present the current one
    token: u64,
    /// `None` while a commit is being persisted for a photo not yet visible
    photo: Option<Arc<IndexedPhoto>>,
}

#[derive(Default)]
pub struct FaceIndex {
    photos: DashMap<i64, Slot>,
    next_token: AtomicU64,
}

impl FaceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the database (daemon or engine startup).
    pub fn load(db: &Database) -> Result<Self> {
        let index = Self::new();
        for photo in db.load_completed_faces()? {
            let indexed = IndexedPhoto::from_stored(
                photo.photo_id,
                photo.event_id,
                photo.created_at,
                &photo.faces,
            );
            index.photos.insert(
                photo.photo_id,
                Slot {
                    token: index.fresh_token(),
                    photo: Some(Arc::new(indexed)),
                },
            );
        }
        tracing::info!(photos = index.len(), "Face index loaded");
        Ok(index)
    }

    /// Persist a face set with `persist`, then publish `photo`.
    ///
    /// No index lock is held while `persist` runs. `persist` returning
    /// `Ok(false)` means the photo no longer exists; the face set is dropped.
    /// A delete or re-queue that lands between `persist` and the publish
    /// also drops it.
    pub fn commit<F>(&self, photo: IndexedPhoto, persist: F) -> Result<CommitOutcome>
    where
        F: FnOnce() -> Result<bool>,
    {
        let photo_id = photo.photo_id;
        let token = self.reserve(photo_id);

        let persisted = match persist() {
            Ok(persisted) => persisted,
            Err(e) => {
                self.photos
                    .remove_if(&photo_id, |_, slot| slot.token == token && slot.photo.is_none());
                return Err(e);
            }
        };

        if !persisted {
            self.photos.remove_if(&photo_id, |_, slot| slot.token == token);
            return Ok(CommitOutcome::Discarded);
        }

        match self.photos.get_mut(&photo_id) {
            Some(mut slot) if slot.token == token => {
                slot.photo = Some(Arc::new(photo));
                Ok(CommitOutcome::Published)
            }
            _ => Ok(CommitOutcome::Discarded),
        }
    }

    /// Run `change` while holding the photo's slot, then hide its face set.
    ///
    /// Used for deletion and re-queue; the slot is removed only if `change`
    /// succeeds.
    pub fn withdraw<T, F>(&self, photo_id: i64, change: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        match self.photos.entry(photo_id) {
            Entry::Occupied(entry) => {
                let value = change()?;
                entry.remove();
                Ok(value)
            }
            Entry::Vacant(_entry) => change(),
        }
    }

    /// Snapshot of the face sets belonging to any event in `scope`.
    pub fn photos_in_scope(&self, scope: &HashSet<i64>) -> Vec<Arc<IndexedPhoto>> {
        if scope.is_empty() {
            return Vec::new();
        }
        self.photos
            .iter()
            .filter_map(|entry| entry.value().photo.clone())
            .filter(|photo| scope.contains(&photo.event_id))
            .collect()
    }

    pub fn get(&self, photo_id: i64) -> Option<Arc<IndexedPhoto>> {
        self.photos.get(&photo_id).and_then(|slot| slot.photo.clone())
    }

    pub fn contains(&self, photo_id: i64) -> bool {
        self.get(photo_id).is_some()
    }

    /// Number of visible face sets.
    pub fn len(&self) -> usize {
        self.photos.iter().filter(|entry| entry.value().photo.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fresh_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Take a new token for the photo's slot, keeping any visible face set.
    fn reserve(&self, photo_id: i64) -> u64 {
        let token = self.fresh_token();
        self.photos
            .entry(photo_id)
            .and_modify(|slot| slot.token = token)
            .or_insert(Slot { token, photo: None });
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo(photo_id: i64, event_id: i64) -> IndexedPhoto {
        IndexedPhoto {
            photo_id,
            event_id,
            created_at: Utc::now(),
            faces: vec![IndexedFace { face_index: 0, embedding: vec![1.0, 0.0] }],
        }
    }

    #[test]
    fn test_commit_publishes_only_when_persisted() {
        let index = FaceIndex::new();

        assert_eq!(index.commit(photo(1, 10), || Ok(true)).unwrap(), CommitOutcome::Published);
        assert_eq!(index.commit(photo(2, 10), || Ok(false)).unwrap(), CommitOutcome::Discarded);

        assert!(index.contains(1));
        assert!(!index.contains(2));
    }

    #[test]
    fn test_failed_persist_leaves_index_untouched() {
        let index = FaceIndex::new();
        let result = index.commit(photo(1, 10), || Err(crate::Error::validation("boom")));
        assert!(result.is_err());
        assert!(index.is_empty());
    }

    #[test]
    fn test_recommit_replaces_face_set() {
        let index = FaceIndex::new();
        index.commit(photo(1, 10), || Ok(true)).unwrap();

        let mut again = photo(1, 10);
        again.faces.push(IndexedFace { face_index: 1, embedding: vec![0.0, 1.0] });
        index.commit(again, || Ok(true)).unwrap();

        assert_eq!(index.len(), 1);
        assert_eq!(index.get(1).unwrap().faces.len(), 2);
    }

    #[test]
    fn test_withdraw_removes_on_success_only() {
        let index = FaceIndex::new();
        index.commit(photo(1, 10), || Ok(true)).unwrap();

        let failed: Result<()> = index.withdraw(1, || Err(crate::Error::validation("no")));
        assert!(failed.is_err());
        assert!(index.contains(1));

        index.withdraw(1, || Ok(())).unwrap();
        assert!(!index.contains(1));
        // Withdrawing an unknown photo still runs the change
        assert_eq!(index.withdraw(5, || Ok(7)).unwrap(), 7);
    }

    #[test]
    fn test_commit_holds_no_lock_while_persisting() {
        let index = FaceIndex::new();

        // A delete landing after the face set was persisted hides it for good
        let outcome = index
            .commit(photo(1, 10), || {
                index.withdraw(1, || Ok(()))?;
                Ok(true)
            })
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Discarded);
        assert!(!index.contains(1));
        assert!(index.is_empty());

        // Other photos stay readable mid-persist
        index.commit(photo(2, 10), || Ok(true)).unwrap();
        index
            .commit(photo(3, 10), || {
                assert!(index.get(2).is_some());
                assert!(!index.contains(3));
                Ok(true)
            })
            .unwrap();
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_stale_commit_loses_to_newer_reservation() {
        let index = FaceIndex::new();
        let outcome = index
            .commit(photo(1, 10), || {
                index.withdraw(1, || Ok(()))?;
                let mut newer = photo(1, 10);
                newer.faces.clear();
                index.commit(newer, || Ok(true))?;
                Ok(true)
            })
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Discarded);
        assert!(index.get(1).unwrap().faces.is_empty());
    }

    #[test]
    fn test_scope_filter() {
        let index = FaceIndex::new();
        index.commit(photo(1, 10), || Ok(true)).unwrap();
        index.commit(photo(2, 20), || Ok(true)).unwrap();

        let scope: HashSet<i64> = [10].into_iter().collect();
        let found = index.photos_in_scope(&scope);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].event_id, 10);
        assert!(index.photos_in_scope(&HashSet::new()).is_empty());
    }
}

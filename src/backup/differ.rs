//! Partitions a fresh enumeration against the previous manifest.

use crate::backup::manifest::{ItemStatus, Manifest, ManifestEntry};
use crate::backup::source::SourceItem;
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::path::{Path, PathBuf};

/// Classifies items one at a time as the enumerator yields them.
///
/// Without a base every item is `Added`. Whatever the base has that was
/// neither seen again nor carried forward comes back from
/// [`SnapshotDiffer::removed`].
pub struct SnapshotDiffer {
    base: BTreeMap<PathBuf, ManifestEntry>,
    settled: HashSet<PathBuf>,
}

impl SnapshotDiffer {
    pub fn new(base: Option<&Manifest>) -> Self {
        let base = base
            .map(|m| {
                m.live_entries()
                    .map(|e| (e.path.clone(), e.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            base,
            settled: HashSet::new(),
        }
    }

    pub fn classify(&mut self, item: &SourceItem) -> ItemStatus {
        if self.base.is_empty() {
            return ItemStatus::Added;
        }
        self.settled.insert(item.path().clone());
        match self.base.get(item.path()) {
            None => ItemStatus::Added,
            Some(prev) if &prev.fingerprint == item.fingerprint() => ItemStatus::Unchanged,
            Some(_) => ItemStatus::Modified,
        }
    }

    /// Base entries for `path` and anything under it, restated as
    /// `Unchanged` so their bytes keep coming from the base chain.
    ///
    /// Used for items that could not be read this time. `path` itself is
    /// carried even when already classified, entries below it only when
    /// not seen yet.
    pub fn carry_forward(&mut self, path: &Path) -> Vec<ManifestEntry> {
        let carried: Vec<ManifestEntry> = self
            .base
            .range::<Path, _>((Bound::Included(path), Bound::Unbounded))
            .take_while(|(p, _)| p.starts_with(path))
            .filter(|(p, _)| p.as_path() == path || !self.settled.contains(*p))
            .map(|(_, e)| ManifestEntry {
                status: ItemStatus::Unchanged,
                ..e.clone()
            })
            .collect();
        for entry in &carried {
            self.settled.insert(entry.path.clone());
        }
        carried
    }

    /// Items the base had that were not seen again, in path order
    pub fn removed(self) -> Vec<ManifestEntry> {
        let settled = self.settled;
        self.base
            .into_values()
            .filter(|e| !settled.contains(&e.path))
            .map(|mut e| {
                e.status = ItemStatus::Removed;
                e
            })
            .collect()
    }
}

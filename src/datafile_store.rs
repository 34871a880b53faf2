//! A thread-safe holder for the currently active datafile. [`DatafileStore`]
//! provides concurrent access for readers (evaluation) and writers (refresh).

use std::sync::{Arc, RwLock};

use crate::datafile::DatafileContent;

/// `DatafileStore` publishes datafile versions through a single swap point.
///
/// The datafile itself is always immutable and can only be replaced fully.
/// An evaluation takes one snapshot at entry and operates on it for its
/// entire duration, so a concurrent refresh never changes a decision halfway
/// through.
pub struct DatafileStore {
    datafile: RwLock<Arc<DatafileContent>>,
}

impl DatafileStore {
    pub fn new(datafile: DatafileContent) -> DatafileStore {
        DatafileStore {
            datafile: RwLock::new(Arc::new(datafile)),
        }
    }

    /// Take a snapshot of the current datafile.
    pub fn get(&self) -> Arc<DatafileContent> {
        // self.datafile.read() should always return Ok(). Err() is possible
        // only if the lock is poisoned (writer panicked while holding the
        // lock), which should never happen.
        let datafile = self
            .datafile
            .read()
            .expect("thread holding datafile lock should not panic");

        datafile.clone()
    }

    /// Install a new datafile.
    pub fn set(&self, datafile: Arc<DatafileContent>) {
        let mut slot = self
            .datafile
            .write()
            .expect("thread holding datafile lock should not panic");

        *slot = datafile;
    }
}

impl Default for DatafileStore {
    fn default() -> DatafileStore {
        DatafileStore::new(DatafileContent::empty())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::DatafileStore;
    use crate::datafile::DatafileContent;

    #[test]
    fn can_set_datafile_from_another_thread() {
        let store = Arc::new(DatafileStore::default());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.set(Arc::new(DatafileContent {
                    revision: "r2".to_owned(),
                    ..DatafileContent::empty()
                }));
            })
            .join();
        }

        assert_eq!(store.get().revision, "r2");
    }

    #[test]
    fn snapshot_outlives_a_swap() {
        let store = DatafileStore::default();
        let snapshot = store.get();

        store.set(Arc::new(DatafileContent {
            revision: "r2".to_owned(),
            ..DatafileContent::empty()
        }));

        // The reader's snapshot still observes the old version.
        assert_eq!(snapshot.revision, "unknown");
        assert_eq!(store.get().revision, "r2");
    }
}

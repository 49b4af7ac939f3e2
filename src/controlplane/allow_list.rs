//! Array Allow-List Gate
//!
//! Synchronous, purely local check run before every per-array call. The list
//! is replaced wholesale; readers take a snapshot of the current `Arc` so they
//! see either the old or the new list in full, never a mix.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Set of array ids this client may operate on. Empty means unrestricted.
#[derive(Debug, Default)]
pub struct AllowList {
    arrays: RwLock<Arc<BTreeSet<String>>>,
}

impl AllowList {
    /// Create an empty (allow-all) list
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a list seeded with the given arrays
    pub fn with_arrays<I, S>(arrays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let list = Self::new();
        list.set_allowed(arrays);
        list
    }

    /// Replace the allow-list. Not additive.
    pub fn set_allowed<I, S>(&self, arrays: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let next: BTreeSet<String> = arrays
            .into_iter()
            .map(|id| {
                let id: String = id.into();
                id.trim().to_string()
            })
            .filter(|id| !id.is_empty())
            .collect();

        info!(count = next.len(), "Replacing array allow-list");
        *self.arrays.write() = Arc::new(next);
    }

    /// Current allowed arrays, sorted
    pub fn get_allowed(&self) -> Vec<String> {
        self.snapshot().iter().cloned().collect()
    }

    /// True if the list is empty or contains `array_id`
    pub fn is_allowed(&self, array_id: &str) -> bool {
        let arrays = self.snapshot();
        arrays.is_empty() || arrays.contains(array_id)
    }

    /// Gate a per-array operation
    pub fn check(&self, array_id: &str) -> Result<()> {
        if self.is_allowed(array_id) {
            debug!(array_id = %array_id, "Array allowed");
            Ok(())
        } else {
            warn!(array_id = %array_id, "Rejecting operation on array outside allow-list");
            Err(Error::UnauthorizedArray {
                array_id: array_id.to_string(),
            })
        }
    }

    /// Keep only allowed ids, preserving order
    pub fn filter(&self, array_ids: Vec<String>) -> Vec<String> {
        let arrays = self.snapshot();
        if arrays.is_empty() {
            return array_ids;
        }
        array_ids
            .into_iter()
            .filter(|id| arrays.contains(id))
            .collect()
    }

    /// Whether any restriction is in place
    pub fn is_restricted(&self) -> bool {
        !self.snapshot().is_empty()
    }

    fn snapshot(&self) -> Arc<BTreeSet<String>> {
        self.arrays.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_empty_allows_everything() {
        let list = AllowList::new();
        assert!(list.is_allowed("000197900046"));
        assert!(list.is_allowed("000000000000"));
        assert!(!list.is_restricted());
        assert!(list.check("anything").is_ok());
    }

    #[test]
    fn test_single_array() {
        let list = AllowList::new();
        list.set_allowed(["000197900046"]);

        assert!(list.is_allowed("000197900046"));
        assert!(!list.is_allowed("000000000000"));
        assert_matches!(
            list.check("000000000000"),
            Err(Error::UnauthorizedArray { array_id }) if array_id == "000000000000"
        );
    }

    #[test]
    fn test_set_replaces() {
        let list = AllowList::with_arrays(["000197900046", "000197900047"]);
        assert_eq!(list.get_allowed().len(), 2);

        list.set_allowed(["000197900048"]);
        assert_eq!(list.get_allowed(), vec!["000197900048".to_string()]);
        assert!(!list.is_allowed("000197900046"));

        list.set_allowed(Vec::<String>::new());
        assert!(list.get_allowed().is_empty());
        assert!(list.is_allowed("000197900046"));
    }

    #[test]
    fn test_blank_entries_and_duplicates() {
        let list = AllowList::with_arrays([" 000197900046 ", "", "000197900046"]);
        assert_eq!(list.get_allowed(), vec!["000197900046".to_string()]);
    }

    #[test]
    fn test_filter_preserves_order() {
        let list = AllowList::with_arrays(["B", "C"]);
        let filtered = list.filter(vec!["C".into(), "A".into(), "B".into()]);
        assert_eq!(filtered, vec!["C".to_string(), "B".to_string()]);

        list.set_allowed(Vec::<String>::new());
        assert_eq!(list.filter(vec!["A".into()]), vec!["A".to_string()]);
    }

    #[test]
    fn test_concurrent_readers_see_whole_lists() {
        let list = Arc::new(AllowList::with_arrays(["A1", "A2"]));
        let writer = {
            let list = list.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    if i % 2 == 0 {
                        list.set_allowed(["B1", "B2"]);
                    } else {
                        list.set_allowed(["A1", "A2"]);
                    }
                }
            })
        };

        for _ in 0..200 {
            let seen = list.get_allowed();
            assert!(
                seen == vec!["A1".to_string(), "A2".to_string()]
                    || seen == vec!["B1".to_string(), "B2".to_string()]
            );
        }
        writer.join().unwrap();
    }
}

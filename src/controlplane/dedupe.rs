//! Order-preserving de-duplication of request arguments

use indexmap::IndexSet;
use std::hash::Hash;

/// Drop repeats, keeping the first occurrence of each item in order
pub(crate) fn unique<T, I>(items: I) -> Vec<T>
where
    T: Hash + Eq,
    I: IntoIterator<Item = T>,
{
    items.into_iter().collect::<IndexSet<T>>().into_iter().collect()
}

/// Trim ids, drop blanks and repeats, keeping first-seen order
pub(crate) fn unique_ids<S: AsRef<str>>(ids: &[S]) -> Vec<String> {
    unique(
        ids.iter()
            .map(|id| id.as_ref().trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string),
    )
}

/// True if some id appears more than once after trimming
pub(crate) fn has_repeats<S: AsRef<str>>(ids: &[S]) -> bool {
    let distinct: IndexSet<&str> = ids.iter().map(|id| id.as_ref().trim()).collect();
    distinct.len() != ids.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::PortKey;

    #[test]
    fn test_unique_ids() {
        assert_eq!(unique_ids(&[" a ", "b", "a", "", "c", "b"]), vec!["a", "b", "c"]);
        assert!(unique_ids::<&str>(&[]).is_empty());
    }

    #[test]
    fn test_unique_keeps_first_order() {
        let ports = unique(vec![
            PortKey::new("SE-2E", "000"),
            PortKey::new("SE-1E", "000"),
            PortKey::new("SE-2E", "000"),
        ]);
        assert_eq!(ports, vec![PortKey::new("SE-2E", "000"), PortKey::new("SE-1E", "000")]);
    }

    #[test]
    fn test_has_repeats() {
        assert!(has_repeats(&["v1", "v1 "]));
        assert!(!has_repeats(&["v1", "v2"]));
    }
}

//! Engine-scoped cache for prepared kernel parameters.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

/// Keyed cache for expensive-to-build kernel objects.
///
/// Insertion happens single-writer at prepare time, before any parallel
/// region is forked; afterwards the map is lookup-only. Keys use structural
/// equality and hashing.
pub(crate) struct ParamsCache<K, V> {
    map: Mutex<HashMap<K, Arc<V>>>,
}

impl<K: Eq + Hash + Clone, V> ParamsCache<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Look up `key`, building and inserting the value on a miss.
    pub(crate) fn get_or_create<E>(
        &self,
        key: &K,
        build: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        let mut map = self.map.lock().expect("params cache poisoned");
        if let Some(hit) = map.get(key) {
            return Ok(Arc::clone(hit));
        }
        let value = Arc::new(build()?);
        map.insert(key.clone(), Arc::clone(&value));
        Ok(value)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.lock().expect("params cache poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_caches() {
        let cache: ParamsCache<u32, String> = ParamsCache::new();

        let a = cache
            .get_or_create::<()>(&1, || Ok("one".to_string()))
            .unwrap();
        let b = cache
            .get_or_create::<()>(&1, || panic!("must not rebuild"))
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_build_error_is_not_cached() {
        let cache: ParamsCache<u32, String> = ParamsCache::new();

        let err = cache.get_or_create(&7, || Err("boom"));
        assert!(err.is_err());
        assert_eq!(cache.len(), 0);

        let ok = cache.get_or_create::<()>(&7, || Ok("fine".to_string()));
        assert!(ok.is_ok());
        assert_eq!(cache.len(), 1);
    }
}

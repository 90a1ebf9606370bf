//! Map-like wrapper over the engine with typed keys and values.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use caskstore_core::{CaskStore, Config, MergeStats, ValueHandle};
use tracing::warn;

use crate::codec::Codec;
use crate::error::{TypedError, TypedResult};

/// Largest value the record framing can hold.
pub const DEFAULT_MAX_VALUE_SIZE: u64 = u32::MAX as u64;

/// Typed view of a `CaskStore`.
///
/// `KC` and `VC` pick the codecs for keys and values. Several typed views
/// may share one engine through the `Arc`.
pub struct TypedStore<K, V, KC, VC> {
    engine: Arc<CaskStore>,
    max_value_size: u64,
    _types: PhantomData<fn() -> (K, V, KC, VC)>,
}

impl<K, V, KC, VC> TypedStore<K, V, KC, VC>
where
    KC: Codec<K>,
    VC: Codec<V>,
{
    pub fn new(engine: Arc<CaskStore>) -> Self {
        Self {
            engine,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            _types: PhantomData,
        }
    }

    /// Open an engine in `path` and wrap it.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> TypedResult<Self> {
        Ok(Self::new(Arc::new(CaskStore::open(path, config)?)))
    }

    /// Values larger than `bytes` are reported as corrupt instead of read.
    pub fn with_max_value_size(mut self, bytes: u64) -> Self {
        self.max_value_size = bytes;
        self
    }

    pub fn engine(&self) -> &Arc<CaskStore> {
        &self.engine
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn insert(&self, key: &K, value: &V) -> TypedResult<()> {
        let key = KC::encode(key)?;
        let value = VC::encode(value)?;
        self.engine.put(&key, &value)?;
        Ok(())
    }

    pub fn get(&self, key: &K) -> TypedResult<Option<V>> {
        let key = KC::encode(key)?;
        match self.engine.get(&key)? {
            Some(handle) => decode_value::<V, VC>(handle, self.max_value_size).map(Some),
            None => Ok(None),
        }
    }

    /// Remove `key`; false if it was absent.
    pub fn remove(&self, key: &K) -> TypedResult<bool> {
        let key = KC::encode(key)?;
        Ok(self.engine.delete(&key)?)
    }

    pub fn contains_key(&self, key: &K) -> TypedResult<bool> {
        let key = KC::encode(key)?;
        Ok(self.engine.contains_key(&key)?)
    }

    pub fn len(&self) -> TypedResult<usize> {
        Ok(self.engine.count()?)
    }

    pub fn is_empty(&self) -> TypedResult<bool> {
        Ok(self.engine.is_empty()?)
    }

    /// Decoded snapshot of the key set.
    pub fn keys(&self) -> TypedResult<Vec<K>> {
        self.engine.keys()?.iter().map(|k| KC::decode(k)).collect()
    }

    /// Lazily decoded `(key, value)` pairs over a snapshot of the key set.
    pub fn iter(&self) -> TypedResult<Iter<'_, K, V, KC, VC>> {
        Ok(Iter {
            inner: self.engine.iter()?,
            max_value_size: self.max_value_size,
            _types: PhantomData,
        })
    }

    /// Lazily decoded values; each is read only when the iterator reaches it.
    pub fn values(&self) -> TypedResult<Values<'_, V, VC>> {
        Ok(Values {
            inner: self.engine.iter()?,
            max_value_size: self.max_value_size,
            _types: PhantomData,
        })
    }

    /// Remove everything.
    pub fn clear(&self) -> TypedResult<()> {
        Ok(self.engine.truncate()?)
    }

    pub fn merge(&self) -> TypedResult<MergeStats> {
        Ok(self.engine.merge()?)
    }

    pub fn flush(&self) -> TypedResult<()> {
        Ok(self.engine.flush()?)
    }
}

impl<K, V, KC, VC> Clone for TypedStore<K, V, KC, VC> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            max_value_size: self.max_value_size,
            _types: PhantomData,
        }
    }
}

impl<K, V, KC, VC> std::fmt::Debug for TypedStore<K, V, KC, VC> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedStore")
            .field("path", &self.engine.path())
            .field("max_value_size", &self.max_value_size)
            .finish()
    }
}

fn decode_value<V, VC: Codec<V>>(mut handle: ValueHandle, max_value_size: u64) -> TypedResult<V> {
    if handle.len() > max_value_size {
        warn!(
            len = handle.len(),
            max = max_value_size,
            "stored value exceeds the value size limit"
        );
        return Err(TypedError::CorruptStore {
            len: handle.len(),
            max: max_value_size,
        });
    }
    let bytes = handle.to_vec()?;
    VC::decode(&bytes)
}

/// Iterator returned by `TypedStore::iter`.
pub struct Iter<'a, K, V, KC, VC> {
    inner: caskstore_core::Iter<'a>,
    max_value_size: u64,
    _types: PhantomData<fn() -> (K, V, KC, VC)>,
}

impl<K, V, KC, VC> Iterator for Iter<'_, K, V, KC, VC>
where
    KC: Codec<K>,
    VC: Codec<V>,
{
    type Item = TypedResult<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        Some(item.map_err(TypedError::from).and_then(|(key, handle)| {
            let key = KC::decode(&key)?;
            let value = decode_value::<V, VC>(handle, self.max_value_size)?;
            Ok((key, value))
        }))
    }
}

/// Iterator returned by `TypedStore::values`.
pub struct Values<'a, V, VC> {
    inner: caskstore_core::Iter<'a>,
    max_value_size: u64,
    _types: PhantomData<fn() -> (V, VC)>,
}

impl<V, VC: Codec<V>> Iterator for Values<'_, V, VC> {
    type Item = TypedResult<V>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        Some(
            item.map_err(TypedError::from)
                .and_then(|(_, handle)| decode_value::<V, VC>(handle, self.max_value_size)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{LeCodec, Utf8Codec};
    use tempfile::TempDir;

    type Names = TypedStore<u32, String, LeCodec<u32>, Utf8Codec>;

    #[test]
    fn test_insert_get_remove() {
        let dir = TempDir::new().unwrap();
        let store = Names::open(dir.path(), Config::default()).unwrap();

        store.insert(&1, &"one".to_string()).unwrap();
        store.insert(&2, &"two".to_string()).unwrap();
        store.insert(&1, &"uno".to_string()).unwrap();
        assert_eq!(store.get(&1).unwrap().as_deref(), Some("uno"));
        assert_eq!(store.len().unwrap(), 2);
        assert!(store.remove(&2).unwrap());
        assert!(!store.remove(&2).unwrap());
        assert!(!store.contains_key(&2).unwrap());
        assert_eq!(store.get(&3).unwrap(), None);
    }

    #[test]
    fn test_oversized_value_reported_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = Names::open(dir.path(), Config::default()).unwrap();
        store.insert(&1, &"a long value".to_string()).unwrap();
        store.insert(&2, &"ok".to_string()).unwrap();

        let strict = store.clone().with_max_value_size(4);
        assert!(matches!(strict.get(&1), Err(TypedError::CorruptStore { len: 12, max: 4 })));
        assert_eq!(strict.get(&2).unwrap().as_deref(), Some("ok"));
    }

    #[test]
    fn test_values_and_keys() {
        let dir = TempDir::new().unwrap();
        let store = Names::open(dir.path(), Config::default()).unwrap();
        for i in 0..10u32 {
            store.insert(&i, &format!("v{}", i)).unwrap();
        }
        let mut keys = store.keys().unwrap();
        keys.sort_unstable();
        assert_eq!(keys, (0..10).collect::<Vec<_>>());

        let mut values: Vec<String> = store.values().unwrap().map(|v| v.unwrap()).collect();
        values.sort();
        assert_eq!(values.len(), 10);
        assert_eq!(values[0], "v0");
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let store = Names::open(dir.path(), Config::default()).unwrap();
        store.insert(&1, &"x".to_string()).unwrap();
        store.clear().unwrap();
        assert!(store.is_empty().unwrap());
    }
}

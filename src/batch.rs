//! Caller-facing batch types: item keys and the ordered image collection.

use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Opaque caller-supplied key identifying one image in a batch.
///
/// Keys are carried as strings because that is how they travel on the wire
/// (picture name, message id, correlation header). Integer keys convert
/// losslessly and can be recovered with [`ItemKey::as_index`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemKey(String);

impl ItemKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value of the key, if it is a plain non-negative integer.
    pub fn as_index(&self) -> Option<u64> {
        if self.0.is_empty() || !self.0.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        self.0.parse().ok()
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ItemKey {
    fn from(key: String) -> Self {
        ItemKey(key)
    }
}

impl From<&str> for ItemKey {
    fn from(key: &str) -> Self {
        ItemKey(key.to_string())
    }
}

macro_rules! item_key_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for ItemKey {
                fn from(key: $t) -> Self {
                    ItemKey(key.to_string())
                }
            }
        )*
    };
}

item_key_from_int!(u16, u32, u64, usize);

/// An ordered collection of images to upload, keyed by [`ItemKey`].
///
/// Insertion order is preserved and is the order results come back in when
/// key rewriting is disabled.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    items: IndexMap<ItemKey, Bytes>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an image. Returns the previous image if the key was already present;
    /// the key keeps its original position.
    pub fn insert(&mut self, key: impl Into<ItemKey>, image: impl Into<Bytes>) -> Option<Bytes> {
        self.items.insert(key.into(), image.into())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ItemKey> {
        self.items.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ItemKey, &Bytes)> {
        self.items.iter()
    }
}

impl<K, V> FromIterator<(K, V)> for Batch
where
    K: Into<ItemKey>,
    V: Into<Bytes>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut batch = Batch::new();
        for (key, image) in iter {
            batch.insert(key, image);
        }
        batch
    }
}

impl IntoIterator for Batch {
    type Item = (ItemKey, Bytes);
    type IntoIter = indexmap::map::IntoIter<ItemKey, Bytes>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

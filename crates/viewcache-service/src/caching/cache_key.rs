use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::types::{ProviderHint, UniqueId};

use super::CacheError;

/// The fingerprint of a view compilation request.
///
/// Two requests with the same view and the same provider hints, in the same order, are
/// expected to compile to equivalent plans. The key is cheap to clone and safe to keep around
/// as a long-lived map key.
#[derive(Clone, Eq)]
pub struct ViewExecutionCacheKey {
    inner: Arc<KeyInner>,
}

#[derive(Eq)]
struct KeyInner {
    view_id: UniqueId,
    hints: Box<[ProviderHint]>,
    metadata: Box<str>,
    hash: [u8; 32],
}

impl PartialEq for KeyInner {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.view_id == other.view_id && self.hints == other.hints
    }
}

impl PartialEq for ViewExecutionCacheKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner == other.inner
    }
}

impl std::hash::Hash for ViewExecutionCacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // the digest covers the view and every hint, in order
        self.inner.hash.hash(state);
    }
}

impl fmt::Debug for ViewExecutionCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewExecutionCacheKey")
            .field("view_id", &self.inner.view_id)
            .field("hints", &self.inner.hints)
            .finish()
    }
}

impl fmt::Display for ViewExecutionCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.view_id)?;
        for hint in self.inner.hints.iter() {
            write!(f, "/{hint}")?;
        }
        Ok(())
    }
}

impl ViewExecutionCacheKey {
    /// Creates the key for a view compiled against the given market data providers.
    ///
    /// Fails with [`CacheError::InvalidArgument`] if `hints` is empty.
    pub fn of(view_id: UniqueId, hints: Vec<ProviderHint>) -> Result<Self, CacheError> {
        if hints.is_empty() {
            return Err(CacheError::InvalidArgument(format!(
                "view `{view_id}` needs at least one provider hint to be cached"
            )));
        }

        let metadata = key_metadata(&view_id, &hints);
        let hash = Sha256::digest(metadata.as_bytes());
        let hash: [u8; 32] = hash.into();

        Ok(Self {
            inner: Arc::new(KeyInner {
                view_id,
                hints: hints.into_boxed_slice(),
                metadata: metadata.into_boxed_str(),
                hash,
            }),
        })
    }

    pub fn view_id(&self) -> &UniqueId {
        &self.inner.view_id
    }

    pub fn hints(&self) -> &[ProviderHint] {
        &self.inner.hints
    }

    /// Returns the human-readable metadata that forms the basis of the key's hash.
    pub fn metadata(&self) -> &str {
        &self.inner.metadata
    }

    /// Returns the relative path of this key in a shared store.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `v$version/aa/bbccdd/eeff...`
    pub fn cache_path(&self, version: u32) -> String {
        let hash = &self.inner.hash;
        let mut path = format!("v{version}/{:02x}/", hash[0]);
        for b in &hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }
}

/// Writes a stable description of the key.
///
/// Components are `Debug`-escaped, so a hint containing a line break can not be confused with
/// two hints.
fn key_metadata(view_id: &UniqueId, hints: &[ProviderHint]) -> String {
    let mut metadata = String::new();
    let _ = writeln!(metadata, "view: {:?}", view_id.to_string());
    for hint in hints {
        let _ = writeln!(metadata, "hint: {:?}", hint.as_ref());
    }
    metadata
}

/// Size-limited secure storage.
///
/// Platform keychains cap the size of a single value. [`ChunkedSecureStore`]
/// splits values above the ceiling into `<key>.g<generation>.chunk-<n>`
/// entries and writes a manifest under the original key. Every rewrite uses a
/// fresh generation and commits by replacing the manifest, so the chunks the
/// current manifest points to are never touched by a write in progress.
/// Small values are stored as-is.
use super::SecureStore;
use crate::errors::{WalletError, WalletResult};

const MANIFEST_PREFIX: &[u8] = b"chunked-v2:";
const MAX_CHUNKS: usize = 1024;
// Room for "<u32 generation>:<chunk count>" after the prefix.
const MANIFEST_BODY_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Manifest {
    generation: u32,
    count: usize,
}

impl Manifest {
    fn encode(&self) -> Vec<u8> {
        let mut encoded = MANIFEST_PREFIX.to_vec();
        encoded.extend_from_slice(format!("{}:{}", self.generation, self.count).as_bytes());
        encoded
    }

    fn parse(raw: &[u8]) -> WalletResult<Option<Self>> {
        let Some(body) = raw.strip_prefix(MANIFEST_PREFIX) else {
            return Ok(None);
        };
        let manifest = std::str::from_utf8(body)
            .ok()
            .and_then(|text| text.split_once(':'))
            .and_then(|(generation, count)| {
                Some(Self {
                    generation: generation.parse().ok()?,
                    count: count.parse().ok()?,
                })
            })
            .filter(|manifest| (1..=MAX_CHUNKS).contains(&manifest.count))
            .ok_or_else(|| WalletError::StorageFailure("Corrupted chunk manifest".to_string()))?;
        Ok(Some(manifest))
    }
}

#[derive(Debug)]
pub struct ChunkedSecureStore<S> {
    inner: S,
    max_value_bytes: usize,
}

impl<S: SecureStore> ChunkedSecureStore<S> {
    /// Wrap `inner`; values longer than `max_value_bytes` are chunked.
    pub fn new(inner: S, max_value_bytes: usize) -> WalletResult<Self> {
        // The manifest itself must fit under the ceiling.
        if max_value_bytes < MANIFEST_PREFIX.len() + MANIFEST_BODY_BYTES {
            return Err(WalletError::ValidationError(format!(
                "Chunk size {} is too small",
                max_value_bytes
            )));
        }
        Ok(Self {
            inner,
            max_value_bytes,
        })
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn max_value_bytes(&self) -> usize {
        self.max_value_bytes
    }

    fn chunk_key(key: &str, generation: u32, index: usize) -> String {
        format!("{}.g{}.chunk-{}", key, generation, index)
    }

    fn current_manifest(&self, key: &str) -> WalletResult<Option<Manifest>> {
        match self.inner.get(key)? {
            Some(raw) => Manifest::parse(&raw),
            None => Ok(None),
        }
    }

    /// Remove the first `count` chunks of `generation`. Leftovers are
    /// unreachable once no manifest names them, so failures only warn.
    fn discard(&self, key: &str, generation: u32, count: usize) {
        for index in 0..count {
            let chunk_key = Self::chunk_key(key, generation, index);
            if let Err(error) = self.inner.delete(&chunk_key) {
                log::warn!("Failed to remove stale chunk '{}': {}", chunk_key, error);
            }
        }
    }

    fn discard_manifest(&self, key: &str, manifest: Option<Manifest>) {
        if let Some(manifest) = manifest {
            self.discard(key, manifest.generation, manifest.count);
        }
    }
}

impl<S: SecureStore> SecureStore for ChunkedSecureStore<S> {
    fn get(&self, key: &str) -> WalletResult<Option<Vec<u8>>> {
        let Some(raw) = self.inner.get(key)? else {
            return Ok(None);
        };
        let Some(manifest) = Manifest::parse(&raw)? else {
            return Ok(Some(raw));
        };

        let mut value = Vec::with_capacity(manifest.count * self.max_value_bytes);
        for index in 0..manifest.count {
            let chunk = self
                .inner
                .get(&Self::chunk_key(key, manifest.generation, index))?
                .ok_or_else(|| {
                    WalletError::StorageFailure(format!(
                        "Missing chunk {} of {} for '{}'",
                        index, manifest.count, key
                    ))
                })?;
            value.extend_from_slice(&chunk);
        }
        Ok(Some(value))
    }

    fn set(&self, key: &str, value: &[u8]) -> WalletResult<()> {
        let previous = self.current_manifest(key)?;

        // A small value that happens to look like a manifest is chunked anyway.
        if value.len() <= self.max_value_bytes && !value.starts_with(MANIFEST_PREFIX) {
            self.inner.set(key, value)?;
            self.discard_manifest(key, previous);
            return Ok(());
        }

        let chunks: Vec<&[u8]> = value.chunks(self.max_value_bytes).collect();
        let count = chunks.len();
        if count > MAX_CHUNKS {
            return Err(WalletError::LimitExceeded(format!(
                "Value for '{}' needs {} chunks (max {})",
                key, count, MAX_CHUNKS
            )));
        }

        let manifest = Manifest {
            generation: previous.map_or(1, |previous| previous.generation.wrapping_add(1)),
            count,
        };
        for (index, chunk) in chunks.iter().enumerate() {
            let chunk_key = Self::chunk_key(key, manifest.generation, index);
            if let Err(error) = self.inner.set(&chunk_key, chunk) {
                self.discard(key, manifest.generation, index + 1);
                return Err(error);
            }
        }

        // The manifest swap is the commit point.
        if let Err(error) = self.inner.set(key, &manifest.encode()) {
            self.discard(key, manifest.generation, count);
            return Err(error);
        }
        log::debug!(
            "Stored '{}' as {} chunks (generation {})",
            key,
            count,
            manifest.generation
        );
        self.discard_manifest(key, previous);
        Ok(())
    }

    fn delete(&self, key: &str) -> WalletResult<()> {
        let previous = self.current_manifest(key)?;
        self.inner.delete(key)?;
        self.discard_manifest(key, previous);
        Ok(())
    }
}

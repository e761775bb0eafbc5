use bytes::Bytes;
use roster_storage::{BlobCache, FilesystemBackend, MemoryBackend};
use std::sync::Arc;
use tempfile::TempDir;

/// Generate deterministic test data using a seeded pseudo-random generator
/// Same seed produces same output (reproducible tests)
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    // Simple LCG (Linear Congruential Generator)
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// One initialized cache per backend. The temp dir must outlive the caches.
#[allow(dead_code)]
pub async fn both_backends() -> (TempDir, Vec<Arc<dyn BlobCache>>) {
    let dir = tempfile::tempdir().unwrap();
    let caches: Vec<Arc<dyn BlobCache>> = vec![
        Arc::new(FilesystemBackend::new(dir.path().join("ScriptCache"))),
        Arc::new(MemoryBackend::new(16 * 1024 * 1024)),
    ];
    for cache in &caches {
        cache.init().await.unwrap();
    }
    (dir, caches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_bytes_deterministic() {
        let data1 = seeded_bytes(42, 1000);
        let data2 = seeded_bytes(42, 1000);
        assert_eq!(data1, data2);
    }

    #[test]
    fn test_seeded_bytes_different_seeds() {
        let data1 = seeded_bytes(42, 1000);
        let data2 = seeded_bytes(43, 1000);
        assert_ne!(data1, data2);
    }
}

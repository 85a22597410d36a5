//! Checksums: fast (path + size + mtime) and exact (whole-content blake3).

use anyhow::{Context, Result};
use blake3::Hasher;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

use crate::utils::config::HashingConsts;

/// Hash a file with blake3. Uses memory-mapped I/O for files above threshold, chunked reading otherwise.
pub fn hash_file(path: &Path, size: u64) -> Result<[u8; 32]> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Hasher::new();

    if size > HashingConsts::HASH_MMAP_THRESHOLD {
        // Memory-mapped I/O for large files (Blake3 already uses SIMD internally)
        let mmap = unsafe { Mmap::map(&file)? };
        hasher.update(&mmap);
    } else {
        use std::io::Read;
        let mut reader =
            std::io::BufReader::with_capacity(HashingConsts::HASH_READ_CHUNK_SIZE, file);
        let mut buffer = vec![0u8; HashingConsts::HASH_READ_CHUNK_SIZE.min(size as usize + 1)];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
    }

    Ok(*hasher.finalize().as_bytes())
}

/// Hex blake3 of the file content. Stats the file for the mmap decision.
pub fn exact_checksum(path: &Path) -> Result<String> {
    let size = std::fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    Ok(to_hex(&hash_file(path, size)?))
}

/// Hex blake3 of `path|size|mtime_ns`. Changes whenever any of the three do.
pub fn fast_checksum(path_key: &str, size: u64, mtime_ns: i64) -> String {
    let mut hasher = Hasher::new();
    hasher.update(path_key.as_bytes());
    hasher.update(b"|");
    hasher.update(&size.to_le_bytes());
    hasher.update(b"|");
    hasher.update(&mtime_ns.to_le_bytes());
    hasher.finalize().to_hex().to_string()
}

pub fn to_hex(bytes: &[u8; 32]) -> String {
    blake3::Hash::from_bytes(*bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn exact_checksum_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("a.txt");
        std::fs::File::create(&p).unwrap().write_all(b"hello").unwrap();
        let first = exact_checksum(&p).unwrap();
        assert_eq!(first, blake3::hash(b"hello").to_hex().to_string());
        std::fs::write(&p, b"hello!").unwrap();
        assert_ne!(exact_checksum(&p).unwrap(), first);
    }

    #[test]
    fn fast_checksum_tracks_metadata() {
        let a = fast_checksum("a", 10, 100);
        assert_eq!(a, fast_checksum("a", 10, 100));
        assert_ne!(a, fast_checksum("a", 11, 100));
        assert_ne!(a, fast_checksum("a", 10, 101));
        assert_ne!(a, fast_checksum("b", 10, 100));
    }
}

//! Local reproduction of the object store's ETag scheme.
//!
//! A single-part ETag is the hex MD5 of the whole object. A multipart ETag is
//! the hex MD5 of the concatenated raw MD5 digests of every part, followed by
//! `-<part count>`. The part size is not recorded anywhere, so it has to be
//! guessed from the sizes common upload tools use.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use md5::{Digest, Md5};
use tracing::debug;

use crate::error::Result;

pub const MIB: u64 = 1024 * 1024;

/// Part size used by the AWS CLI and SDK transfer managers.
pub const DEFAULT_MULTIPART_PART_SIZE: u64 = 8 * MIB;

/// Part size used by s3cmd.
pub const LEGACY_MULTIPART_PART_SIZE: u64 = 15 * MIB;

const READ_BUFFER: usize = 64 * 1024;

/// A parsed remote ETag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ETag {
    Single(String),
    Multipart { digest: String, parts: u64 },
}

impl ETag {
    /// Parse an ETag as returned on the wire, surrounding quotes included.
    /// Returns `None` for anything that cannot be a content ETag.
    pub fn parse(raw: &str) -> Option<Self> {
        let value = raw.trim().trim_matches('"').to_lowercase();
        match value.split_once('-') {
            None => is_md5_hex(&value).then_some(ETag::Single(value)),
            Some((digest, parts)) => {
                let parts: u64 = parts.parse().ok()?;
                (is_md5_hex(digest) && parts > 0).then(|| ETag::Multipart {
                    digest: digest.to_string(),
                    parts,
                })
            }
        }
    }
}

fn is_md5_hex(value: &str) -> bool {
    value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Hex MD5 of the whole file.
pub fn file_md5<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Multipart ETag of a file split into `part_size` chunks.
pub fn multipart_etag<P: AsRef<Path>>(path: P, part_size: u64) -> Result<String> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; READ_BUFFER];
    let mut digests: Vec<u8> = Vec::new();
    let mut parts = 0u64;

    loop {
        let mut part = Md5::new();
        let mut in_part = 0u64;
        while in_part < part_size {
            let want = (part_size - in_part).min(buffer.len() as u64) as usize;
            let read = file.read(&mut buffer[..want])?;
            if read == 0 {
                break;
            }
            part.update(&buffer[..read]);
            in_part += read as u64;
        }
        if in_part == 0 {
            break;
        }
        digests.extend_from_slice(&part.finalize());
        parts += 1;
        if in_part < part_size {
            break;
        }
    }

    Ok(format!("{}-{}", hex::encode(Md5::digest(&digests)), parts))
}

/// Multipart ETag of an in-memory buffer, as the store computes it on upload.
pub fn multipart_etag_of(data: &[u8], part_size: u64) -> String {
    let mut digests: Vec<u8> = Vec::new();
    let mut parts = 0u64;
    for chunk in data.chunks(part_size.max(1) as usize) {
        digests.extend_from_slice(&Md5::digest(chunk));
        parts += 1;
    }
    format!("{}-{}", hex::encode(Md5::digest(&digests)), parts)
}

/// `ceil(size / parts)` rounded up to the next MiB boundary.
pub fn aligned_part_size(size: u64, parts: u64) -> u64 {
    let per_part = size.div_ceil(parts.max(1));
    per_part.div_ceil(MIB).max(1) * MIB
}

/// Candidate part sizes for a file of `size` bytes uploaded in `parts` parts,
/// in the order they are tried. Sizes that cannot produce `parts` chunks are dropped.
pub fn candidate_part_sizes(size: u64, parts: u64) -> Vec<u64> {
    let mut candidates = Vec::with_capacity(3);
    for part_size in [
        DEFAULT_MULTIPART_PART_SIZE,
        LEGACY_MULTIPART_PART_SIZE,
        aligned_part_size(size, parts),
    ] {
        let plausible = part_size < size && size.div_ceil(part_size) <= parts;
        if plausible && !candidates.contains(&part_size) {
            candidates.push(part_size);
        }
    }
    candidates
}

/// Decide whether the local file has the content described by `remote_etag`.
pub fn matches<P: AsRef<Path>>(path: P, size: u64, remote_etag: &str) -> Result<bool> {
    let path = path.as_ref();
    let Some(etag) = ETag::parse(remote_etag) else {
        debug!("Unrecognized ETag '{}' for {}", remote_etag, path.display());
        return Ok(false);
    };

    match etag {
        ETag::Single(digest) => Ok(file_md5(path)? == digest),
        ETag::Multipart { digest, parts } => {
            let expected = format!("{}-{}", digest, parts);
            for part_size in candidate_part_sizes(size, parts) {
                let local = multipart_etag(path, part_size)?;
                debug!("{} with part size {} -> {}", path.display(), part_size, local);
                if local == expected {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            ETag::parse("\"9E107D9D372BB6826BD81D3542A419D6\""),
            Some(ETag::Single("9e107d9d372bb6826bd81d3542a419d6".to_string()))
        );
        assert_eq!(
            ETag::parse("9e107d9d372bb6826bd81d3542a419d6-3"),
            Some(ETag::Multipart { digest: "9e107d9d372bb6826bd81d3542a419d6".to_string(), parts: 3 })
        );
        assert_eq!(ETag::parse("9e107d9d372bb6826bd81d3542a419d6-0"), None);
        assert_eq!(ETag::parse("9e107d9d372bb6826bd81d3542a419d6-x"), None);
        assert_eq!(ETag::parse("not-an-etag"), None);
    }

    #[test]
    fn test_single_part_match() {
        let file = write_temp(b"The quick brown fox jumps over the lazy dog");
        let size = 43;
        assert!(matches(file.path(), size, "\"9e107d9d372bb6826bd81d3542a419d6\"").unwrap());
        assert!(!matches(file.path(), size, "\"e4d909c290d0fb1ca068ffaddf22cbd0\"").unwrap());
    }

    #[test]
    fn test_aligned_part_size() {
        assert_eq!(aligned_part_size(3 * MIB + 1, 2), 2 * MIB);
        assert_eq!(aligned_part_size(4 * MIB, 2), 2 * MIB);
        assert_eq!(aligned_part_size(10, 5), MIB);
    }

    #[test]
    fn test_candidates_filtered() {
        // 1 KiB can never be split into several parts of the candidate sizes
        assert!(candidate_part_sizes(1024, 5).is_empty());
        // 20 MiB in 3 parts: 8 MiB gives 3 parts, 15 MiB gives 2, aligned gives 7 MiB
        assert_eq!(
            candidate_part_sizes(20 * MIB, 3),
            vec![DEFAULT_MULTIPART_PART_SIZE, LEGACY_MULTIPART_PART_SIZE, 7 * MIB]
        );
        // 20 MiB in 2 parts: 8 MiB would need 3 parts
        assert_eq!(candidate_part_sizes(20 * MIB, 2), vec![LEGACY_MULTIPART_PART_SIZE, 10 * MIB]);
    }

    #[test]
    fn test_streamed_and_buffered_etags_agree() {
        let data = pattern((2 * MIB + 12_345) as usize);
        let file = write_temp(&data);
        assert_eq!(multipart_etag(file.path(), MIB).unwrap(), multipart_etag_of(&data, MIB));
        assert!(multipart_etag_of(&data, MIB).ends_with("-3"));
    }

    #[test]
    fn test_multipart_round_trip_aligned_candidate() {
        let data = pattern((3 * MIB + 1) as usize);
        let file = write_temp(&data);
        let etag = multipart_etag_of(&data, aligned_part_size(data.len() as u64, 2));
        assert!(etag.ends_with("-2"));
        assert!(matches(file.path(), data.len() as u64, &format!("\"{}\"", etag)).unwrap());
    }

    #[test]
    fn test_multipart_round_trip_default_candidate() {
        let data = pattern((9 * MIB) as usize);
        let file = write_temp(&data);
        let etag = multipart_etag_of(&data, DEFAULT_MULTIPART_PART_SIZE);
        assert!(matches(file.path(), data.len() as u64, &etag).unwrap());
    }

    #[test]
    fn test_multipart_round_trip_legacy_candidate() {
        let data = pattern((16 * MIB) as usize);
        let file = write_temp(&data);
        let etag = multipart_etag_of(&data, LEGACY_MULTIPART_PART_SIZE);
        assert!(etag.ends_with("-2"));
        assert!(matches(file.path(), data.len() as u64, &etag).unwrap());
    }

    #[test]
    fn test_unsatisfiable_part_count_never_matches() {
        let data = pattern(1024);
        let file = write_temp(&data);
        let etag = multipart_etag_of(&data, 100);
        assert!(!matches(file.path(), data.len() as u64, &etag).unwrap());
    }

    #[test]
    fn test_changed_content_mismatch() {
        let data = pattern((3 * MIB + 1) as usize);
        let etag = multipart_etag_of(&data, 2 * MIB);
        let mut changed = data.clone();
        changed[10] ^= 0xff;
        let file = write_temp(&changed);
        assert!(!matches(file.path(), changed.len() as u64, &etag).unwrap());
    }
}

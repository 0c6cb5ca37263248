//! Assembly of several uploads into one destination upload.

use std::io::{self, Read};

use mdf_config::log_store_debug;
use tracing::instrument;

use crate::chunk::ChunkStore;
use crate::Result;

/// Append the full content of each source, in the given order, to `dest`.
///
/// Each source contributes the bytes it holds when its turn comes; later
/// appends to it, including those made by this call when `dest` is itself
/// listed as a source, are not followed.
///
/// Stops at the first source that cannot be read or copied. Whatever was
/// appended up to that point stays in `dest`. The destination's metadata
/// is not touched. Returns the number of bytes appended.
#[instrument(skip(chunks, sources), level = "debug")]
pub fn concat_uploads<S: AsRef<str>>(chunks: &ChunkStore, dest: &str, sources: &[S]) -> Result<u64> {
    let mut out = chunks.open_append(dest)?;

    let mut total = 0;
    for source in sources {
        let id = source.as_ref();
        let src = chunks.reader(id)?;
        let len = chunks.offset(id)?;
        let copied = io::copy(&mut src.take(len), &mut out)?;
        log_store_debug!("Appended partial upload", dest = dest, source = id, bytes = copied);
        total += copied;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn upload(chunks: &ChunkStore, id: &str, data: &[u8]) {
        chunks.create(id).unwrap();
        chunks.append(id, data).unwrap();
    }

    #[test]
    fn test_concat_preserves_order() {
        let temp = TempDir::new().unwrap();
        let chunks = ChunkStore::new(temp.path());
        upload(&chunks, "a", b"first-");
        upload(&chunks, "b", b"");
        upload(&chunks, "c", b"third");
        upload(&chunks, "dest", b"");

        let n = concat_uploads(&chunks, "dest", &["c", "b", "a"]).unwrap();

        assert_eq!(n, 11);
        assert_eq!(fs::read(chunks.path("dest")).unwrap(), b"thirdfirst-");
    }

    #[test]
    fn test_concat_appends_after_existing_content() {
        let temp = TempDir::new().unwrap();
        let chunks = ChunkStore::new(temp.path());
        upload(&chunks, "dest", b"[");
        upload(&chunks, "a", b"x");

        concat_uploads(&chunks, "dest", &["a", "a"]).unwrap();
        assert_eq!(fs::read(chunks.path("dest")).unwrap(), b"[xx");
    }

    #[test]
    fn test_concat_fails_fast_without_rollback() {
        let temp = TempDir::new().unwrap();
        let chunks = ChunkStore::new(temp.path());
        upload(&chunks, "dest", b"");
        upload(&chunks, "a", b"aa");
        upload(&chunks, "c", b"cc");

        let err = concat_uploads(&chunks, "dest", &["a", "missing", "c"]).unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(fs::read(chunks.path("dest")).unwrap(), b"aa");
    }

    #[test]
    fn test_concat_destination_as_source() {
        let temp = TempDir::new().unwrap();
        let chunks = ChunkStore::new(temp.path());
        upload(&chunks, "d", b"abc");
        upload(&chunks, "e", b"-");

        let n = concat_uploads(&chunks, "d", &["d", "e", "d"]).unwrap();

        // the second "d" sees the bytes appended by the first
        assert_eq!(n, 3 + 1 + 7);
        assert_eq!(fs::read(chunks.path("d")).unwrap(), b"abcabc-abcabc-");
    }

    #[test]
    fn test_concat_missing_destination() {
        let temp = TempDir::new().unwrap();
        let chunks = ChunkStore::new(temp.path());
        upload(&chunks, "a", b"aa");
        let err = concat_uploads(&chunks, "nope", &["a"]).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_concat_no_sources() {
        let temp = TempDir::new().unwrap();
        let chunks = ChunkStore::new(temp.path());
        upload(&chunks, "dest", b"keep");
        let none: [&str; 0] = [];
        assert_eq!(concat_uploads(&chunks, "dest", &none).unwrap(), 0);
        assert_eq!(fs::read(chunks.path("dest")).unwrap(), b"keep");
    }
}

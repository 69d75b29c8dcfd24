//! Canonical request utilities
//!
//! Builds the pieces of a request that end up in the signed message: the
//! normalized path and query, and a SHA-256 digest of the body. The digest
//! is computed with a bounded read so a lying `Content-Length` cannot make
//! the gateway buffer more than [`MAX_BODY_BYTES`].

use crate::error::AuthError;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io::{self, Read};

/// Largest body accepted for hashing (5 MiB)
pub const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

/// Initial buffer size when the declared length is small or unknown
const MIN_BODY_BUFFER: usize = 8 * 1024;

/// Read chunk size
const READ_CHUNK: usize = 8 * 1024;

/// Normalize a raw (percent-encoded) path and query into canonical form.
///
/// An empty path becomes `/`, a single trailing `/` is stripped from paths
/// longer than one character, and a present query is appended verbatim.
pub fn normalize_path_and_query(raw_path: &str, raw_query: Option<&str>) -> String {
    let mut canonical = if raw_path.is_empty() {
        "/".to_string()
    } else if raw_path.len() > 1 && raw_path.ends_with('/') {
        raw_path[..raw_path.len() - 1].to_string()
    } else {
        raw_path.to_string()
    };

    if let Some(query) = raw_query {
        canonical.push('?');
        canonical.push_str(query);
    }
    canonical
}

/// Normalize a URI; `http::Uri` keeps path and query in their raw form
pub fn normalize_uri(uri: &http::Uri) -> String {
    normalize_path_and_query(uri.path(), uri.query())
}

/// A body that has been read for hashing and can be handed on downstream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestedBody {
    digest_hex: Option<String>,
    body: Bytes,
}

impl DigestedBody {
    /// Hex SHA-256 of the body, `None` for an empty body
    pub fn digest_hex(&self) -> Option<&str> {
        self.digest_hex.as_deref()
    }

    /// The exact bytes that were hashed
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// A fresh reader over the consumed bytes
    pub fn reader(&self) -> io::Cursor<Bytes> {
        io::Cursor::new(self.body.clone())
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }
}

/// Bounded accumulator shared by the blocking and the streaming readers
#[derive(Debug)]
pub struct BodyAccumulator {
    buffer: Vec<u8>,
    max_bytes: usize,
}

impl BodyAccumulator {
    /// Refuses oversized declared lengths before anything is allocated.
    pub fn new(declared_length: Option<u64>, max_bytes: usize) -> Result<Self, AuthError> {
        let declared = match declared_length {
            Some(len) if len > max_bytes as u64 => {
                return Err(AuthError::BodyTooLarge { max: max_bytes });
            }
            Some(len) => len as usize,
            None => 0,
        };
        let capacity = declared.max(MIN_BODY_BUFFER).min(max_bytes);
        Ok(Self { buffer: Vec::with_capacity(capacity), max_bytes })
    }

    /// Append a chunk; the declared length is only a hint, the cap is not
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), AuthError> {
        if self.buffer.len() + chunk.len() > self.max_bytes {
            return Err(AuthError::BodyTooLarge { max: self.max_bytes });
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn finish(self) -> DigestedBody {
        if self.buffer.is_empty() {
            return DigestedBody::default();
        }
        let digest_hex = hex::encode(Sha256::digest(&self.buffer));
        DigestedBody { digest_hex: Some(digest_hex), body: Bytes::from(self.buffer) }
    }
}

/// Hash a request body read from `reader`, capped at [`MAX_BODY_BYTES`].
///
/// A declared length of zero short-circuits without touching the reader.
/// `None` means the length is unknown (chunked transfer) and the stream is
/// read until EOF or until the cap is hit.
pub fn body_digest<R: Read>(
    reader: &mut R,
    declared_length: Option<u64>,
) -> Result<DigestedBody, AuthError> {
    body_digest_with_limit(reader, declared_length, MAX_BODY_BYTES)
}

/// [`body_digest`] with an explicit cap
pub fn body_digest_with_limit<R: Read>(
    reader: &mut R,
    declared_length: Option<u64>,
    max_bytes: usize,
) -> Result<DigestedBody, AuthError> {
    if declared_length == Some(0) {
        return Ok(DigestedBody::default());
    }

    let mut accumulator = BodyAccumulator::new(declared_length, max_bytes)?;
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let read = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(AuthError::BodyRead(e.to_string())),
        };
        accumulator.push(&chunk[..read])?;
    }
    Ok(accumulator.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Reader that fails the test if it is ever touched
    struct UntouchableReader;

    impl Read for UntouchableReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            panic!("reader must not be read");
        }
    }

    #[test]
    fn test_normalize_examples() {
        assert_eq!(normalize_path_and_query("/a/b/", None), "/a/b");
        assert_eq!(normalize_path_and_query("/", None), "/");
        assert_eq!(normalize_path_and_query("", None), "/");
        assert_eq!(normalize_path_and_query("/a", Some("x=1")), "/a?x=1");
        assert_eq!(normalize_path_and_query("/api/offers/", None), "/api/offers");
    }

    #[test]
    fn test_normalize_keeps_percent_encoding() {
        let uri: http::Uri = "http://localhost/api/a%20b/?q=%2F".parse().unwrap();
        assert_eq!(normalize_uri(&uri), "/api/a%20b?q=%2F");
    }

    #[test]
    fn test_zero_declared_length_is_not_read() {
        let digested = body_digest(&mut UntouchableReader, Some(0)).unwrap();
        assert_eq!(digested.digest_hex(), None);
        assert!(digested.body().is_empty());
    }

    #[test]
    fn test_oversize_declared_length_rejected_before_read() {
        let six_mib = 6 * 1024 * 1024;
        let err = body_digest(&mut UntouchableReader, Some(six_mib)).unwrap_err();
        assert_eq!(err, AuthError::BodyTooLarge { max: MAX_BODY_BYTES });
    }

    #[test]
    fn test_understated_length_still_capped() {
        let body = vec![7u8; 64];
        let err = body_digest_with_limit(&mut body.as_slice(), Some(4), 32).unwrap_err();
        assert_eq!(err, AuthError::BodyTooLarge { max: 32 });
    }

    #[test]
    fn test_empty_stream_has_no_digest() {
        let digested = body_digest(&mut io::empty(), None).unwrap();
        assert_eq!(digested.digest_hex(), None);
    }

    #[test]
    fn test_known_digest() {
        let digested = body_digest(&mut "abc".as_bytes(), Some(3)).unwrap();
        assert_eq!(
            digested.digest_hex(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn test_accumulator_capacity_is_bounded() {
        let accumulator = BodyAccumulator::new(Some(MAX_BODY_BYTES as u64), MAX_BODY_BYTES).unwrap();
        assert!(accumulator.buffer.capacity() <= MAX_BODY_BYTES);
        let accumulator = BodyAccumulator::new(None, MAX_BODY_BYTES).unwrap();
        assert!(accumulator.buffer.capacity() >= MIN_BODY_BUFFER);
        assert!(accumulator.is_empty());
    }

    proptest! {
        #[test]
        fn prop_normalize_is_idempotent(path in "(/[a-z0-9%]{0,6}){0,4}/?", query in proptest::option::of("[a-z]=[0-9]{1,3}")) {
            let once = normalize_path_and_query(&path, query.as_deref());
            let (p, q) = match once.split_once('?') {
                Some((p, q)) => (p.to_string(), Some(q.to_string())),
                None => (once.clone(), None),
            };
            let twice = normalize_path_and_query(&p, q.as_deref());
            // A path like "/a//" only loses one slash per pass
            if !path.ends_with("//") {
                prop_assert_eq!(once, twice);
            }
        }

        #[test]
        fn prop_digest_restores_body(body in proptest::collection::vec(any::<u8>(), 0..32 * 1024)) {
            let digested = body_digest(&mut body.as_slice(), Some(body.len() as u64)).unwrap();

            let mut restored = Vec::new();
            digested.reader().read_to_end(&mut restored).unwrap();
            prop_assert_eq!(&restored, &body);

            if body.is_empty() {
                prop_assert!(digested.digest_hex().is_none());
            } else {
                let expected = hex::encode(Sha256::digest(&body));
                prop_assert_eq!(digested.digest_hex(), Some(expected.as_str()));
            }
        }
    }
}

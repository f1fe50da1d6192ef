use std::fmt;

use http::Method;
use sha2::{Digest, Sha256};

use crate::util::encode_hex_lower;

const FIELD_SEPARATOR: &[u8] = b"\x1f";

/// Identity of a request for duplicate detection.
///
/// Derived from the method, the resolved URL without its query, the query
/// pairs in sorted order and the body bytes. Pair order in the query string
/// does not change the fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct RequestFingerprint([u8; 32]);

impl RequestFingerprint {
    pub(crate) fn compute(
        method: &Method,
        url: &str,
        query_pairs: &[(String, String)],
        body: &[u8],
    ) -> Self {
        let mut sorted_pairs: Vec<&(String, String)> = query_pairs.iter().collect();
        sorted_pairs.sort();

        let mut hasher = Sha256::new();
        hasher.update(method.as_str().as_bytes());
        hasher.update(FIELD_SEPARATOR);
        hasher.update(url.as_bytes());
        for (name, value) in sorted_pairs {
            hasher.update(FIELD_SEPARATOR);
            update_length_prefixed(&mut hasher, name.as_bytes());
            update_length_prefixed(&mut hasher, value.as_bytes());
        }
        hasher.update(FIELD_SEPARATOR);
        hasher.update(Sha256::digest(body));
        Self(hasher.finalize().into())
    }
}

/// Query names and values are caller-supplied and unescaped, so each one is
/// framed by its length.
fn update_length_prefixed(hasher: &mut Sha256, field: &[u8]) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field);
}

impl fmt::Debug for RequestFingerprint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_tuple("RequestFingerprint")
            .field(&encode_hex_lower(&self.0[..8]))
            .finish()
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&encode_hex_lower(&self.0))
    }
}

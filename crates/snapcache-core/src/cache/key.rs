use reqwest::header::HeaderMap;
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

/// Fingerprint of a prepared request.
///
/// Every component is length-prefixed before hashing so distinct requests
/// cannot produce the same byte stream. Header order does not matter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_request(method: &Method, url: &Url, headers: &HeaderMap, body: Option<&[u8]>) -> Self {
        let mut hasher = Sha256::new();
        write_field(&mut hasher, method.as_str().as_bytes());
        write_field(&mut hasher, url.as_str().as_bytes());

        let mut pairs: Vec<(&str, &[u8])> = headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_bytes()))
            .collect();
        pairs.sort();
        hasher.update((pairs.len() as u64).to_le_bytes());
        for (name, value) in pairs {
            write_field(&mut hasher, name.as_bytes());
            write_field(&mut hasher, value);
        }

        match body {
            Some(body) => {
                hasher.update([1u8]);
                write_field(&mut hasher, body);
            }
            None => hasher.update([0u8]),
        }

        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use sha1::Sha1;
use url::Url;

type HmacSha1 = Hmac<Sha1>;

// Object keys keep their `/` separators when placed in a URL path.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Access/secret key pair used to sign every request against the bucket.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key: String,
    secret_key: String,
}

#[derive(Debug, Serialize)]
struct PutPolicy {
    scope: String,
    deadline: i64,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    /// Returns `access_key:base64url(hmac_sha1(secret_key, data))`.
    pub fn sign(&self, data: &[u8]) -> String {
        format!("{}:{}", self.access_key, self.digest(data))
    }

    /// Signs the base64url encoding of `data` and appends it, as used by upload tokens.
    pub fn sign_with_data(&self, data: &[u8]) -> String {
        let encoded = URL_SAFE.encode(data);
        format!("{}:{}", self.sign(encoded.as_bytes()), encoded)
    }

    /// Upload token scoped to a single `bucket:key`, so the upload may overwrite that key only.
    pub fn upload_token(
        &self,
        bucket: &str,
        key: &str,
        deadline: i64,
    ) -> Result<String, serde_json::Error> {
        let policy = PutPolicy {
            scope: format!("{bucket}:{key}"),
            deadline,
        };
        let body = serde_json::to_vec(&policy)?;
        Ok(self.sign_with_data(&body))
    }

    /// Value of the `Authorization` header for management requests (list, delete).
    pub fn management_authorization(&self, url: &Url, body: Option<&[u8]>) -> String {
        let mut data = url.path().as_bytes().to_vec();
        if let Some(query) = url.query() {
            data.push(b'?');
            data.extend_from_slice(query.as_bytes());
        }
        data.push(b'\n');
        if let Some(body) = body {
            data.extend_from_slice(body);
        }
        format!("QBox {}", self.sign(&data))
    }

    /// Time-limited read URL for `key` under `base` (a download domain, scheme optional).
    pub fn private_download_url(
        &self,
        base: &str,
        key: &str,
        deadline: i64,
    ) -> Result<Url, url::ParseError> {
        let base = if base.contains("://") {
            base.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", base.trim_end_matches('/'))
        };
        let unsigned = format!("{base}/{}?e={deadline}", encode_key(key));
        let token = self.sign(unsigned.as_bytes());
        Url::parse(&format!("{unsigned}&token={token}"))
    }

    fn digest(&self, data: &[u8]) -> String {
        let mut mac = HmacSha1::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(data);
        URL_SAFE.encode(mac.finalize().into_bytes())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// `base64url("bucket:key")`, the entry identifier used in management paths.
pub fn encode_entry(bucket: &str, key: &str) -> String {
    URL_SAFE.encode(format!("{bucket}:{key}"))
}

pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ENCODE_SET).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::new("access-key", "secret-key")
    }

    #[test]
    fn sign_prefixes_access_key() {
        assert_eq!(
            creds().sign(b"hello"),
            "access-key:J5rb-6R5G3Md2aC4ofFuty27aR0="
        );
    }

    #[test]
    fn upload_token_embeds_scoped_policy() {
        let token = creds()
            .upload_token("photos", "a.txt", 1_700_000_000)
            .unwrap();
        assert_eq!(
            token,
            "access-key:qayl6f8ALHKhkx_T6CIMYJ3CyAE=:eyJzY29wZSI6InBob3RvczphLnR4dCIsImRlYWRsaW5lIjoxNzAwMDAwMDAwfQ=="
        );
    }

    #[test]
    fn management_authorization_signs_path_and_newline() {
        let entry = encode_entry("photos", "docs/a.txt");
        assert_eq!(entry, "cGhvdG9zOmRvY3MvYS50eHQ=");
        let url = Url::parse(&format!("https://rs.example/delete/{entry}")).unwrap();
        assert_eq!(
            creds().management_authorization(&url, None),
            "QBox access-key:DDeZkUODAO0VxZlXe_sWiaGkmwE="
        );
    }

    #[test]
    fn management_authorization_includes_query() {
        let url = Url::parse("https://rsf.example/list?bucket=photos&prefix=&limit=1000").unwrap();
        assert_eq!(
            creds().management_authorization(&url, None),
            "QBox access-key:BCtf_PML07AJVOlpWe6aNmDE68A="
        );
    }

    #[test]
    fn private_download_url_defaults_to_http_and_signs_deadline() {
        let url = creds()
            .private_download_url("cdn.example.com", "docs/hello world.txt", 1_700_000_000)
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://cdn.example.com/docs/hello%20world.txt?e=1700000000&token=access-key:GHzVe2-6GXC9ZuyIf4LQORqbq6I="
        );
    }

    #[test]
    fn debug_redacts_secret() {
        let rendered = format!("{:?}", creds());
        assert!(rendered.contains("access-key"));
        assert!(!rendered.contains("secret-key"));
    }
}

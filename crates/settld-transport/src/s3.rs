use chrono::{DateTime, Utc};
use hex::ToHex;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint: String,
    pub sse: Option<String>,
}

#[derive(Debug, Error)]
pub enum S3Error {
    #[error("s3 request failed: {0}")]
    Request(String),
    #[error("s3 put rejected, status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub ok: bool,
    pub status_code: u16,
    pub body_text: String,
}

/// AWS SigV4 request signer and uploader, scoped to single-shot PUT object calls.
pub struct S3Signer {
    config: S3Config,
    client: reqwest::Client,
}

fn hmac_bytes(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().encode_hex::<String>()
}

/// Percent-encodes a path segment the way SigV4 canonical URIs require: every byte outside
/// `A-Za-z0-9-_.~` is escaped, and `/` is preserved as a path separator.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        let is_unreserved = byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~');
        if is_unreserved || (byte == b'/' && !encode_slash) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

impl S3Signer {
    pub fn new(config: S3Config) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn derive_signing_key(&self, date_stamp: &str) -> Vec<u8> {
        let k_date = hmac_bytes(format!("AWS4{}", self.config.secret_access_key).as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_bytes(&k_date, self.config.region.as_bytes());
        let k_service = hmac_bytes(&k_region, b"s3");
        hmac_bytes(&k_service, b"aws4_request")
    }

    /// Builds the canonical request, string to sign, and resulting `Authorization` header
    /// for a PUT of `body` at `key`, timestamped `now`.
    fn sign_put(&self, key: &str, body: &[u8], now: DateTime<Utc>) -> (String, Vec<(String, String)>) {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let host = format!("{}.{}", self.config.bucket, self.config.endpoint);
        let payload_hash = sha256_hex(body);
        let canonical_uri = format!("/{}", uri_encode(key, false));

        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(sse) = &self.config.sse {
            headers.push(("x-amz-server-side-encryption".to_string(), sse.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_request = format!(
            "PUT\n{canonical_uri}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );
        let credential_scope = format!("{date_stamp}/{}/s3/aws4_request", self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );

        let signing_key = self.derive_signing_key(&date_stamp);
        let signature: String = hmac_bytes(&signing_key, string_to_sign.as_bytes()).encode_hex();

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.config.access_key_id
        );

        let mut request_headers = headers;
        request_headers.push(("authorization".to_string(), authorization));
        (format!("https://{host}{canonical_uri}"), request_headers)
    }

    pub async fn put(&self, key: &str, body: Vec<u8>, now: DateTime<Utc>) -> Result<PutResult, S3Error> {
        let (url, headers) = self.sign_put(key, &body, now);
        let mut request = self.client.put(&url);
        for (name, value) in headers {
            if name == "host" {
                continue;
            }
            request = request.header(name, value);
        }
        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| S3Error::Request(e.to_string()))?;
        let status = response.status().as_u16();
        let body_text = response.text().await.unwrap_or_default();
        let ok = (200..300).contains(&status);
        if !ok {
            return Err(S3Error::Rejected { status, body: body_text });
        }
        Ok(PutResult { ok, status_code: status, body_text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn signer() -> S3Signer {
        S3Signer::new(S3Config {
            bucket: "settld-artifacts".to_string(),
            region: "us-east-1".to_string(),
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY".to_string(),
            endpoint: "s3.amazonaws.com".to_string(),
            sse: None,
        })
    }

    #[test]
    fn signs_put_with_expected_credential_scope() {
        let s = signer();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let (url, headers) = s.sign_put("reports/run-1.json", b"{}", now);
        assert_eq!(url, "https://settld-artifacts.s3.amazonaws.com/reports/run-1.json");
        let auth = headers.iter().find(|(k, _)| k == "authorization").unwrap();
        assert!(auth.1.contains("Credential=AKIDEXAMPLE/20240301/us-east-1/s3/aws4_request"));
        assert!(auth.1.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
    }

    #[test]
    fn signature_changes_when_body_changes() {
        let s = signer();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let (_, headers_a) = s.sign_put("k", b"a", now);
        let (_, headers_b) = s.sign_put("k", b"b", now);
        let sig_a = headers_a.iter().find(|(k, _)| k == "authorization").unwrap();
        let sig_b = headers_b.iter().find(|(k, _)| k == "authorization").unwrap();
        assert_ne!(sig_a.1, sig_b.1);
    }

    #[test]
    fn uri_encode_preserves_path_separators_but_not_spaces() {
        assert_eq!(uri_encode("a/b c", true), "a%2Fb%20c");
        assert_eq!(uri_encode("a/b c", false), "a/b%20c");
    }

    #[test]
    fn sse_header_is_included_and_signed_when_configured() {
        let mut config_with_sse = S3Config {
            bucket: "settld-artifacts".to_string(),
            region: "us-east-1".to_string(),
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY".to_string(),
            endpoint: "s3.amazonaws.com".to_string(),
            sse: Some("AES256".to_string()),
        };
        config_with_sse.sse = Some("AES256".to_string());
        let s = S3Signer::new(config_with_sse);
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let (_, headers) = s.sign_put("k", b"{}", now);
        assert!(headers.iter().any(|(k, v)| k == "x-amz-server-side-encryption" && v == "AES256"));
        let auth = headers.iter().find(|(k, _)| k == "authorization").unwrap();
        assert!(auth.1.contains("x-amz-server-side-encryption"));
    }
}

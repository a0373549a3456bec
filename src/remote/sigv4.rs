//! Minimal AWS SigV4 request signing for the S3-like remote provider.
//! Only the pieces GoCICa's S3 client actually needs: signing a handful
//! of headers on a request, and presigning a query-string GET URL for
//! streamed range reads. Not a general-purpose SigV4 implementation.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use time::OffsetDateTime;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct S3Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn signing_key(creds: &S3Credentials, date_stamp: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{}", creds.secret_key).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac(&k_date, creds.region.as_bytes());
    let k_service = hmac(&k_region, b"s3");
    hmac(&k_service, b"aws4_request")
}

/// Signs `headers` (already containing `host` and any `x-amz-*` headers
/// the caller wants covered) for a request to `method` + `canonical_uri`
/// with no query string, returning the `Authorization` header value.
pub fn sign_headers(
    creds: &S3Credentials,
    method: &str,
    canonical_uri: &str,
    headers: &BTreeMap<String, String>,
    payload_hash: &str,
    now: OffsetDateTime,
) -> (String, String) {
    let amz_date = format_amz_date(now);
    let date_stamp = format_date_stamp(now);

    let mut all_headers = headers.clone();
    all_headers.insert("x-amz-date".to_string(), amz_date.clone());
    all_headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());

    let signed_header_names: Vec<&str> = all_headers.keys().map(|s| s.as_str()).collect();
    let signed_headers = signed_header_names.join(";");

    let canonical_headers: String = all_headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();

    let canonical_request = format!(
        "{method}\n{uri}\n\n{headers}\n{signed}\n{hash}",
        method = method,
        uri = canonical_uri,
        headers = canonical_headers,
        signed = signed_headers,
        hash = payload_hash,
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, creds.region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{date}\n{scope}\n{hash}",
        date = amz_date,
        scope = credential_scope,
        hash = sha256_hex(canonical_request.as_bytes()),
    );

    let key = signing_key(creds, &date_stamp);
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key, credential_scope, signed_headers, signature
    );

    (authorization, amz_date)
}

/// Builds a presigned query-string URL valid for `expires_seconds`,
/// suitable for a GET (download) against `host` + `canonical_uri`.
pub fn presign_get_url(
    creds: &S3Credentials,
    host: &str,
    canonical_uri: &str,
    expires_seconds: u64,
    now: OffsetDateTime,
) -> String {
    let amz_date = format_amz_date(now);
    let date_stamp = format_date_stamp(now);
    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, creds.region);
    let credential = format!("{}/{}", creds.access_key, credential_scope);

    let mut query: BTreeMap<String, String> = BTreeMap::new();
    query.insert("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string());
    query.insert("X-Amz-Credential".to_string(), urlencoding_component(&credential));
    query.insert("X-Amz-Date".to_string(), amz_date.clone());
    query.insert("X-Amz-Expires".to_string(), expires_seconds.to_string());
    query.insert("X-Amz-SignedHeaders".to_string(), "host".to_string());

    let canonical_query: String = query
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_headers = format!("host:{}\n", host);
    let canonical_request = format!(
        "GET\n{uri}\n{query}\n{headers}\nhost\nUNSIGNED-PAYLOAD",
        uri = canonical_uri,
        query = canonical_query,
        headers = canonical_headers,
    );

    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{date}\n{scope}\n{hash}",
        date = amz_date,
        scope = credential_scope,
        hash = sha256_hex(canonical_request.as_bytes()),
    );

    let key = signing_key(creds, &date_stamp);
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

    format!(
        "https://{host}{uri}?{query}&X-Amz-Signature={sig}",
        host = host,
        uri = canonical_uri,
        query = canonical_query,
        sig = signature,
    )
}

fn format_amz_date(t: OffsetDateTime) -> String {
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        t.year(),
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

fn format_date_stamp(t: OffsetDateTime) -> String {
    format!("{:04}{:02}{:02}", t.year(), u8::from(t.month()), t.day())
}

fn urlencoding_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

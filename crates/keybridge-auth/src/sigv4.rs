//! Minimal SigV4 request signing for the chained role-assumption call.
//!
//! Only the shape this crate sends is supported: a form-encoded POST with no
//! query string. Anything more general belongs in a signing library.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use keybridge_core::{Error, Result};
use sha2::{Digest, Sha256};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Static credentials used to sign one request.
pub(crate) struct SigningKey<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub session_token: Option<&'a str>,
}

/// Headers the caller must attach to the outgoing request.
pub(crate) struct SignedRequest {
    pub authorization: String,
    pub amz_date: String,
    pub content_type: &'static str,
    pub security_token: Option<String>,
}

/// Sign a form POST to `host``path` with the given body.
pub(crate) fn sign_post_form(
    key: &SigningKey<'_>,
    region: &str,
    service: &str,
    host: &str,
    path: &str,
    body: &str,
    now: DateTime<Utc>,
) -> Result<SignedRequest> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let scope = format!("{}/{}/{}/aws4_request", date_stamp, region, service);

    // Canonical headers must be sorted by name; the token header sorts after
    // x-amz-date.
    let mut canonical_headers = format!(
        "content-type:{}\nhost:{}\nx-amz-date:{}\n",
        FORM_CONTENT_TYPE, host, amz_date
    );
    let mut signed_headers = "content-type;host;x-amz-date".to_string();
    if let Some(token) = key.session_token {
        canonical_headers.push_str(&format!("x-amz-security-token:{}\n", token));
        signed_headers.push_str(";x-amz-security-token");
    }

    let payload_hash = hex::encode(Sha256::digest(body.as_bytes()));
    let canonical_request = format!(
        "POST\n{}\n\n{}\n{}\n{}",
        path, canonical_headers, signed_headers, payload_hash
    );

    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let secret = format!("AWS4{}", key.secret_access_key);
    let k_date = hmac(secret.as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    let k_signing = hmac(&k_service, b"aws4_request")?;
    let signature = hex::encode(hmac(&k_signing, string_to_sign.as_bytes())?);

    Ok(SignedRequest {
        authorization: format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, key.access_key_id, scope, signed_headers, signature
        ),
        amz_date,
        content_type: FORM_CONTENT_TYPE,
        security_token: key.session_token.map(str::to_string),
    })
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|err| Error::AuthenticationFailed(format!("signing failed: {}", err)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

//! AWS Signature Version 4 request signing.
//!
//! Produces the `x-amz-date`, optional `x-amz-security-token`, and
//! `authorization` headers for a request. The canonical request signs the
//! `host` and `x-amz-date` headers (plus the security token when present)
//! and the exact payload bytes; the signing-key chain is the standard
//! HMAC-SHA256 cascade over date, region, service, and `aws4_request`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::AwsCredentials;
use crate::error::{LlmError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Inputs to one signing operation.
pub struct SigningParams<'a> {
    /// Credentials and region.
    pub credentials: &'a AwsCredentials,
    /// AWS service name (`bedrock` for the runtime API).
    pub service: &'a str,
    /// HTTP method.
    pub method: &'a str,
    /// Full request URL.
    pub url: &'a str,
    /// Exact payload bytes that will be sent.
    pub payload: &'a [u8],
    /// Signing time; callers pass `SystemTime::now()`, tests pin a value.
    pub timestamp: SystemTime,
}

/// Compute the signature headers for a request.
///
/// Returns `(name, value)` pairs to append to the request headers:
/// `x-amz-date`, `x-amz-security-token` (when the credentials carry one),
/// and `authorization`.
pub fn sign(params: &SigningParams<'_>) -> Result<Vec<(String, String)>> {
    let url = reqwest::Url::parse(params.url)
        .map_err(|e| LlmError::Configuration(format!("unsignable URL '{}': {e}", params.url)))?;
    let host = url
        .host_str()
        .ok_or_else(|| LlmError::Configuration("URL has no host".into()))?
        .to_string();
    let path = if url.path().is_empty() { "/" } else { url.path() };
    let query = url.query().unwrap_or("");

    let unix = params
        .timestamp
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    let (amz_date, date_stamp) = format_amz_date(unix);

    let creds = params.credentials;
    let payload_hash = hex::encode(Sha256::digest(params.payload));

    // Canonical headers, sorted by name.
    let mut header_pairs = vec![
        ("host".to_string(), host),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(ref token) = creds.session_token {
        header_pairs.push(("x-amz-security-token".to_string(), token.clone()));
    }
    header_pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let canonical_headers: String = header_pairs
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let signed_headers: String = header_pairs
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        params.method, path, query, canonical_headers, signed_headers, payload_hash
    );

    let scope = format!(
        "{date_stamp}/{}/{}/aws4_request",
        creds.region, params.service
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac(
        format!("AWS4{}", creds.secret_access_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac(&k_date, creds.region.as_bytes());
    let k_service = hmac(&k_region, params.service.as_bytes());
    let k_signing = hmac(&k_service, b"aws4_request");
    let signature = hex::encode(hmac(&k_signing, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        creds.access_key_id
    );

    let mut headers = vec![("x-amz-date".to_string(), amz_date)];
    if let Some(ref token) = creds.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    headers.push(("authorization".to_string(), authorization));
    Ok(headers)
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Format a unix timestamp as (`YYYYMMDD'T'HHMMSS'Z'`, `YYYYMMDD`).
fn format_amz_date(unix_secs: u64) -> (String, String) {
    let days = (unix_secs / 86_400) as i64;
    let rem = unix_secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    let date = format!("{year:04}{month:02}{day:02}");
    let datetime = format!(
        "{date}T{:02}{:02}{:02}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    );
    (datetime, date)
}

/// Days-since-epoch to civil date (Howard Hinnant's algorithm).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> AwsCredentials {
        AwsCredentials {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
            session_token: None,
            region: "us-east-1".into(),
        }
    }

    fn params<'a>(creds: &'a AwsCredentials, timestamp: u64) -> SigningParams<'a> {
        SigningParams {
            credentials: creds,
            service: "bedrock",
            method: "POST",
            url: "https://bedrock-runtime.us-east-1.amazonaws.com/model/anthropic.claude-3-sonnet-v1:0/invoke",
            payload: b"{\"messages\":[]}",
            timestamp: UNIX_EPOCH + Duration::from_secs(timestamp),
        }
    }

    #[test]
    fn test_amz_date_formatting() {
        // 2015-08-30T12:36:00Z, the date of the AWS reference suite.
        let (datetime, date) = format_amz_date(1_440_938_160);
        assert_eq!(datetime, "20150830T123600Z");
        assert_eq!(date, "20150830");

        let (epoch, epoch_date) = format_amz_date(0);
        assert_eq!(epoch, "19700101T000000Z");
        assert_eq!(epoch_date, "19700101");
    }

    #[test]
    fn test_civil_from_days_leap_years() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        // 2000-02-29 is day 11016.
        assert_eq!(civil_from_days(11_016), (2000, 2, 29));
        // 2024-12-31 is day 20088.
        assert_eq!(civil_from_days(20_088), (2024, 12, 31));
    }

    #[test]
    fn test_sign_produces_expected_headers() {
        let creds = credentials();
        let headers = sign(&params(&creds, 1_440_938_160)).unwrap();

        let date = headers.iter().find(|(k, _)| k == "x-amz-date").unwrap();
        assert_eq!(date.1, "20150830T123600Z");

        let auth = headers.iter().find(|(k, _)| k == "authorization").unwrap();
        assert!(auth.1.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/bedrock/aws4_request"));
        assert!(auth.1.contains("SignedHeaders=host;x-amz-date"));
        let signature = auth.1.split("Signature=").nth(1).unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sign_is_deterministic() {
        let creds = credentials();
        let a = sign(&params(&creds, 1_440_938_160)).unwrap();
        let b = sign(&params(&creds, 1_440_938_160)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_signature_varies_with_secret_and_payload() {
        let creds = credentials();
        let base = sign(&params(&creds, 1_440_938_160)).unwrap();

        let other_creds = AwsCredentials {
            secret_access_key: "different".into(),
            ..credentials()
        };
        let other_secret = sign(&params(&other_creds, 1_440_938_160)).unwrap();
        assert_ne!(base.last(), other_secret.last());

        let mut p = params(&creds, 1_440_938_160);
        p.payload = b"{\"messages\":[{\"role\":\"user\"}]}";
        let other_payload = sign(&p).unwrap();
        assert_ne!(base.last(), other_payload.last());
    }

    #[test]
    fn test_session_token_signed_when_present() {
        let creds = AwsCredentials {
            session_token: Some("the-token".into()),
            ..credentials()
        };
        let headers = sign(&params(&creds, 1_440_938_160)).unwrap();
        assert!(headers
            .iter()
            .any(|(k, v)| k == "x-amz-security-token" && v == "the-token"));
        let auth = headers.iter().find(|(k, _)| k == "authorization").unwrap();
        assert!(auth
            .1
            .contains("SignedHeaders=host;x-amz-date;x-amz-security-token"));
    }
}

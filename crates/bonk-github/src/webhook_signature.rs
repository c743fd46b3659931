use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::webhook_events::WebhookError;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Verifies a GitHub `sha256=<hex>` HMAC over the raw request body.
pub fn verify_github_signature(
    payload: &[u8],
    signature: Option<&str>,
    secret: &str,
) -> Result<(), WebhookError> {
    let signature = signature
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(WebhookError::MissingSignature)?;
    let digest_hex = signature
        .strip_prefix("sha256=")
        .ok_or(WebhookError::MalformedSignature)?;
    let expected = decode_hex(digest_hex).ok_or(WebhookError::MalformedSignature)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::SignatureMismatch)?;
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::SignatureMismatch)
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.len() % 2 != 0 {
        return None;
    }
    trimmed
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(text, 16).ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    use super::verify_github_signature;
    use crate::webhook_events::WebhookError;

    fn sign(payload: &[u8], secret: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("mac");
        mac.update(payload);
        let digest = mac.finalize().into_bytes();
        let hex = digest
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>();
        format!("sha256={hex}")
    }

    #[test]
    fn unit_verify_accepts_matching_signature() {
        let payload = br#"{"action":"created"}"#;
        let signature = sign(payload, "s3cret");
        verify_github_signature(payload, Some(signature.as_str()), "s3cret").expect("valid");
    }

    #[test]
    fn regression_verify_rejects_wrong_secret_and_tampered_body() {
        let payload = br#"{"action":"created"}"#;
        let signature = sign(payload, "s3cret");
        assert!(matches!(
            verify_github_signature(payload, Some(signature.as_str()), "other"),
            Err(WebhookError::SignatureMismatch)
        ));
        assert!(matches!(
            verify_github_signature(b"{}", Some(signature.as_str()), "s3cret"),
            Err(WebhookError::SignatureMismatch)
        ));
    }

    #[test]
    fn regression_verify_rejects_missing_and_malformed_headers() {
        assert!(matches!(
            verify_github_signature(b"{}", None, "s3cret"),
            Err(WebhookError::MissingSignature)
        ));
        assert!(matches!(
            verify_github_signature(b"{}", Some("sha1=abcd"), "s3cret"),
            Err(WebhookError::MalformedSignature)
        ));
        assert!(matches!(
            verify_github_signature(b"{}", Some("sha256=zz"), "s3cret"),
            Err(WebhookError::MalformedSignature)
        ));
    }
}

//! Webhook authentication.

use crate::error::IntakeError;
use crate::webhook::{WebhookAuth, WebhookRequest};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use ring::hmac;
use subtle::ConstantTimeEq;

/// Checks a delivery against the trigger's authentication settings.
///
/// # Errors
///
/// Returns `IntakeError::Authentication` when credentials are missing,
/// malformed, or wrong.
pub fn authenticate(auth: &WebhookAuth, request: &WebhookRequest) -> Result<(), IntakeError> {
    match auth {
        WebhookAuth::None => Ok(()),
        WebhookAuth::Basic { username, password } => {
            verify_basic(request.header("authorization"), username, password)
        }
        WebhookAuth::Header { name, value } => {
            let presented = request
                .header(name)
                .ok_or_else(|| IntakeError::authentication(format!("missing {name} header")))?;
            if constant_time_eq(presented.as_bytes(), value.as_bytes()) {
                Ok(())
            } else {
                Err(IntakeError::authentication(format!("wrong {name} header")))
            }
        }
        WebhookAuth::Signature {
            header,
            secret,
            prefix,
        } => {
            let presented = request.header(header).ok_or_else(|| {
                IntakeError::authentication(format!("missing {header} signature header"))
            })?;
            verify_signature(secret, prefix.as_deref(), presented, &request.body)
        }
    }
}

fn verify_basic(
    authorization: Option<&str>,
    username: &str,
    password: &str,
) -> Result<(), IntakeError> {
    let encoded = authorization
        .and_then(|value| value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic ")))
        .ok_or_else(|| IntakeError::authentication("missing basic credentials"))?;
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| IntakeError::authentication("basic credentials are not base64"))?;
    let expected = format!("{username}:{password}");
    if constant_time_eq(&decoded, expected.as_bytes()) {
        Ok(())
    } else {
        Err(IntakeError::authentication("wrong basic credentials"))
    }
}

/// Verifies a hex HMAC-SHA256 of `body`, optionally behind `prefix`.
///
/// # Errors
///
/// Returns `IntakeError::Authentication` for a missing prefix, bad hex or a
/// mismatching digest.
pub fn verify_signature(
    secret: &str,
    prefix: Option<&str>,
    presented: &str,
    body: &[u8],
) -> Result<(), IntakeError> {
    let digest = match prefix {
        Some(prefix) => presented.strip_prefix(prefix).ok_or_else(|| {
            IntakeError::authentication(format!("signature does not start with {prefix}"))
        })?,
        None => presented,
    };
    let expected = hex::decode(digest.trim())
        .map_err(|_| IntakeError::authentication("signature is not hex encoded"))?;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let computed = hmac::sign(&key, body);
    if constant_time_eq(computed.as_ref(), &expected) {
        Ok(())
    } else {
        Err(IntakeError::authentication("signature mismatch"))
    }
}

/// Hex HMAC-SHA256 of `body`, as a sender would compute it.
#[must_use]
pub fn sign(secret: &str, body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hex::encode(hmac::sign(&key, body).as_ref())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).unwrap_u8() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature_auth(prefix: Option<&str>) -> WebhookAuth {
        WebhookAuth::Signature {
            header: "X-Hub-Signature-256".to_string(),
            secret: "topsecret".to_string(),
            prefix: prefix.map(str::to_string),
        }
    }

    #[test]
    fn none_accepts_anything() {
        assert!(authenticate(&WebhookAuth::None, &WebhookRequest::new("POST")).is_ok());
    }

    #[test]
    fn basic_credentials() {
        let auth = WebhookAuth::Basic {
            username: "hook".to_string(),
            password: "pw".to_string(),
        };
        let good = WebhookRequest::new("POST")
            .with_header("Authorization", format!("Basic {}", STANDARD.encode("hook:pw")));
        let bad = WebhookRequest::new("POST")
            .with_header("Authorization", format!("Basic {}", STANDARD.encode("hook:nope")));

        assert!(authenticate(&auth, &good).is_ok());
        assert!(matches!(
            authenticate(&auth, &bad),
            Err(IntakeError::Authentication { .. })
        ));
        assert!(authenticate(&auth, &WebhookRequest::new("POST")).is_err());
    }

    #[test]
    fn header_secret() {
        let auth = WebhookAuth::Header {
            name: "X-Token".to_string(),
            value: "s3cret".to_string(),
        };
        let good = WebhookRequest::new("POST").with_header("x-token", "s3cret");
        let bad = WebhookRequest::new("POST").with_header("x-token", "s3cre");
        assert!(authenticate(&auth, &good).is_ok());
        assert!(authenticate(&auth, &bad).is_err());
    }

    #[test]
    fn prefixed_signature() {
        let body = br#"{"action":"opened"}"#;
        let header = format!("sha256={}", sign("topsecret", body));
        let request = WebhookRequest::new("POST")
            .with_header("X-Hub-Signature-256", header)
            .with_body(body.to_vec());
        assert!(authenticate(&signature_auth(Some("sha256=")), &request).is_ok());
        assert!(authenticate(&signature_auth(None), &request).is_err());
    }

    #[test]
    fn tampered_body_fails() {
        let header = sign("topsecret", b"original");
        let request = WebhookRequest::new("POST")
            .with_header("X-Hub-Signature-256", header)
            .with_body(b"tampered".to_vec());
        assert!(matches!(
            authenticate(&signature_auth(None), &request),
            Err(IntakeError::Authentication { .. })
        ));
    }

    #[test]
    fn malformed_signature_fails() {
        let request = WebhookRequest::new("POST").with_header("X-Hub-Signature-256", "zz");
        assert!(authenticate(&signature_auth(None), &request).is_err());
    }
}

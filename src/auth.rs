use axum::{
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};

pub type AuthRejection = (StatusCode, Json<Value>);

pub fn verify_bearer(headers: &HeaderMap, expected_key: &str) -> Result<(), AuthRejection> {
    let token = bearer_token(headers)?;
    if !keys_match(token.trim(), expected_key) {
        return Err(unauthorized("Invalid API key"));
    }
    Ok(())
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthRejection> {
    let Some(raw_header) = headers.get(AUTHORIZATION) else {
        return Err(unauthorized("Missing Authorization header"));
    };

    let Ok(value) = raw_header.to_str() else {
        return Err(unauthorized("Invalid Authorization header"));
    };

    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") => Ok(token),
        _ => Err(unauthorized("Authorization must use Bearer token")),
    }
}

/// Compares without stopping at the first differing byte.
fn keys_match(given: &str, expected: &str) -> bool {
    given.len() == expected.len()
        && given
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn unauthorized(message: &str) -> AuthRejection {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "code": "UNAUTHORIZED",
                "message": message
            }
        })),
    )
}

#[cfg(test)]
mod tests {
    use axum::http::{header::AUTHORIZATION, HeaderMap, HeaderValue};

    use super::verify_bearer;

    fn with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).expect("header"));
        headers
    }

    #[test]
    fn accepts_matching_bearer_token() {
        assert!(verify_bearer(&with_auth("Bearer secret"), "secret").is_ok());
        assert!(verify_bearer(&with_auth("bearer secret "), "secret").is_ok());
    }

    #[test]
    fn rejects_missing_wrong_or_non_bearer_credentials() {
        assert!(verify_bearer(&HeaderMap::new(), "secret").is_err());
        assert!(verify_bearer(&with_auth("Bearer secreT"), "secret").is_err());
        assert!(verify_bearer(&with_auth("Bearer secre"), "secret").is_err());
        assert!(verify_bearer(&with_auth("Basic c2VjcmV0"), "secret").is_err());
    }
}

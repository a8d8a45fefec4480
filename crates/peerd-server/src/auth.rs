//! Bearer token authentication for the API

use hyper::header::AUTHORIZATION;
use hyper::Request;
use subtle::ConstantTimeEq;

/// Outcome of checking a request's credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Authorized,
    Unauthorized,
}

/// Checks `Authorization: Bearer <secret>` against the configured secret
#[derive(Clone)]
pub struct BearerAuth {
    secret: Option<String>,
}

impl BearerAuth {
    /// An empty secret disables authentication
    pub fn new(secret: &str) -> Self {
        let secret = secret.trim();
        Self {
            secret: (!secret.is_empty()).then(|| secret.to_string()),
        }
    }

    pub fn disabled() -> Self {
        Self { secret: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    pub fn validate<B>(&self, req: &Request<B>) -> AuthDecision {
        let Some(secret) = &self.secret else {
            return AuthDecision::Authorized;
        };

        let presented = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().strip_prefix("Bearer "))
            .map(str::trim);

        match presented {
            Some(token) if bool::from(token.as_bytes().ct_eq(secret.as_bytes())) => {
                AuthDecision::Authorized
            }
            _ => AuthDecision::Unauthorized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(auth: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().method("POST").uri("/get");
        if let Some(value) = auth {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_valid_token() {
        let auth = BearerAuth::new("s3cret");
        assert_eq!(
            auth.validate(&request(Some("Bearer s3cret"))),
            AuthDecision::Authorized
        );
        assert_eq!(
            auth.validate(&request(Some("  Bearer s3cret  "))),
            AuthDecision::Authorized
        );
    }

    #[test]
    fn test_rejected_tokens() {
        let auth = BearerAuth::new("s3cret");
        for value in [
            None,
            Some("s3cret"),
            Some("Bearer wrong"),
            Some("Basic s3cret"),
            Some("Bearer "),
            Some("Bearer s3cre"),
            Some("Bearer s3cret2"),
        ] {
            assert_eq!(
                auth.validate(&request(value)),
                AuthDecision::Unauthorized,
                "{:?}",
                value
            );
        }
    }

    #[test]
    fn test_empty_secret_disables_auth() {
        let auth = BearerAuth::new("  ");
        assert!(!auth.is_enabled());
        assert_eq!(auth.validate(&request(None)), AuthDecision::Authorized);
        assert!(!BearerAuth::disabled().is_enabled());
    }
}

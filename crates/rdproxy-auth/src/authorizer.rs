//! Authorizer trait and the shared-secret implementation

use crate::SECRET_HEADER;
use http::Request;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Identity of a caller that passed authorization
#[derive(Clone, PartialEq, Eq)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// The shared-secret identity is the credential itself, keep it out of logs.
impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Identity(<redacted>)")
    }
}

/// Authorization errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("{0} not specified in request header")]
    MissingCredential(&'static str),

    #[error("{0} does not match the configured secret")]
    InvalidCredential(&'static str),

    #[error("{0} header is not valid text")]
    MalformedCredential(&'static str),
}

/// Decides whether a registration request may create an agent session
///
/// Implementations must be free of side effects: they are called
/// concurrently from every registration attempt. Returning an error always
/// means the registration is rejected and no pool entry is created.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, request: &Request<()>) -> Result<Identity, AuthError>;
}

impl<F> Authorizer for F
where
    F: Fn(&Request<()>) -> Result<Identity, AuthError> + Send + Sync,
{
    fn authorize(&self, request: &Request<()>) -> Result<Identity, AuthError> {
        self(request)
    }
}

/// Allows a registration iff its secret header equals the configured secret
#[derive(Clone)]
pub struct SharedSecretAuthorizer {
    secret: String,
}

impl SharedSecretAuthorizer {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for SharedSecretAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecretAuthorizer").finish_non_exhaustive()
    }
}

impl Authorizer for SharedSecretAuthorizer {
    fn authorize(&self, request: &Request<()>) -> Result<Identity, AuthError> {
        let value = request
            .headers()
            .get(SECRET_HEADER)
            .ok_or(AuthError::MissingCredential(SECRET_HEADER))?;

        let presented = value
            .to_str()
            .map_err(|_| AuthError::MalformedCredential(SECRET_HEADER))?;

        let matches: bool = presented.as_bytes().ct_eq(self.secret.as_bytes()).into();
        if !matches {
            tracing::debug!(path = %request.uri().path(), "Registration credential mismatch");
            return Err(AuthError::InvalidCredential(SECRET_HEADER));
        }

        Ok(Identity::new(presented))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::REGISTRATION_PATH;

    fn request_with(secret: Option<&str>) -> Request<()> {
        let mut builder = Request::get(REGISTRATION_PATH);
        if let Some(secret) = secret {
            builder = builder.header(SECRET_HEADER, secret);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_matching_secret_is_allowed() {
        let authorizer = SharedSecretAuthorizer::new("test-secret");
        let identity = authorizer
            .authorize(&request_with(Some("test-secret")))
            .unwrap();
        assert_eq!(identity.as_str(), "test-secret");
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let authorizer = SharedSecretAuthorizer::new("test-secret");
        for candidate in ["test-secreT", "test-secret ", "", "test"] {
            let err = authorizer
                .authorize(&request_with(Some(candidate)))
                .unwrap_err();
            assert_eq!(err, AuthError::InvalidCredential(SECRET_HEADER));
        }
    }

    #[test]
    fn test_missing_header_is_rejected() {
        let authorizer = SharedSecretAuthorizer::new("test-secret");
        let err = authorizer.authorize(&request_with(None)).unwrap_err();
        assert_eq!(err, AuthError::MissingCredential(SECRET_HEADER));
        assert!(err.to_string().contains("not specified"));
    }

    #[test]
    fn test_header_name_is_case_insensitive() {
        let authorizer = SharedSecretAuthorizer::new("abc");
        let request = Request::get(REGISTRATION_PATH)
            .header("x-api-tunnel-secret", "abc")
            .body(())
            .unwrap();
        assert!(authorizer.authorize(&request).is_ok());
    }

    #[test]
    fn test_closure_authorizer() {
        let allow_all =
            |_: &Request<()>| -> Result<Identity, AuthError> { Ok(Identity::new("client-id")) };
        let identity = allow_all.authorize(&request_with(None)).unwrap();
        assert_eq!(identity.as_str(), "client-id");
    }

    #[test]
    fn test_identity_debug_is_redacted() {
        let identity = Identity::new("hunter2");
        assert!(!format!("{:?}", identity).contains("hunter2"));
    }
}

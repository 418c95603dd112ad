use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tonic::metadata::MetadataValue;
use tonic::service::Interceptor;
use tonic::{Request, Status};

use crate::auth::{Principal, TokenAuthority, USER_NAME_HEADER, USER_TOKEN_HEADER};

/// Server side: verifies the caller's token and stores the resulting
/// [`Principal`] in the request extensions.
#[derive(Clone)]
pub struct AuthInterceptor {
    authority: Arc<TokenAuthority>,
}

impl AuthInterceptor {
    pub fn new(authority: Arc<TokenAuthority>) -> Self {
        Self { authority }
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let metadata = request.metadata();
        let user = metadata
            .get(USER_NAME_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Status::unauthenticated("missing user name"))?;
        let token = metadata
            .get(USER_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Status::unauthenticated("missing token"))?;

        let principal = self
            .authority
            .authenticate(user, token, Utc::now())
            .map_err(|e| {
                tracing::debug!(user, error = %e, "Rejected credentials");
                Status::from(e)
            })?;
        request.extensions_mut().insert(principal);
        Ok(request)
    }
}

/// The principal the interceptor attached to a request.
pub fn principal<T>(request: &Request<T>) -> Result<Principal, Status> {
    request
        .extensions()
        .get::<Principal>()
        .cloned()
        .ok_or_else(|| Status::unauthenticated("missing credentials"))
}

#[derive(Clone)]
enum TokenSource {
    Static(String),
    /// Mint a fresh token for every call.
    Signed {
        authority: Arc<TokenAuthority>,
        lifetime: Duration,
    },
}

/// Client side: attaches user name and token metadata to outgoing calls.
#[derive(Clone)]
pub struct CredentialInjector {
    user: String,
    source: TokenSource,
}

impl CredentialInjector {
    /// Present a token obtained elsewhere.
    pub fn with_token(user: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            source: TokenSource::Static(token.into()),
        }
    }

    /// Sign short-lived tokens for `user` with a locally held key.
    pub fn signing(user: impl Into<String>, authority: Arc<TokenAuthority>, lifetime: Duration) -> Self {
        Self {
            user: user.into(),
            source: TokenSource::Signed {
                authority,
                lifetime,
            },
        }
    }

    fn token(&self) -> Result<String, Status> {
        match &self.source {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::Signed {
                authority,
                lifetime,
            } => authority
                .issue(&self.user, *lifetime, Utc::now())
                .map_err(|e| Status::internal(format!("cannot sign token: {e}"))),
        }
    }
}

impl Interceptor for CredentialInjector {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let user = MetadataValue::try_from(self.user.as_str())
            .map_err(|_| Status::invalid_argument("user name is not valid metadata"))?;
        let token = MetadataValue::try_from(self.token()?.as_str())
            .map_err(|_| Status::internal("token is not valid metadata"))?;
        let metadata = request.metadata_mut();
        metadata.insert(USER_NAME_HEADER, user);
        metadata.insert(USER_TOKEN_HEADER, token);
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SigningKey;

    fn authority() -> Arc<TokenAuthority> {
        Arc::new(
            TokenAuthority::new(SigningKey::new(vec![3u8; 32]).unwrap())
                .with_admins(["root".to_string()]),
        )
    }

    #[test]
    fn injected_credentials_pass_the_server_check() {
        let authority = authority();
        let mut injector =
            CredentialInjector::signing("node:n1", authority.clone(), Duration::from_secs(30));
        let mut server = AuthInterceptor::new(authority);

        let request = injector.call(Request::new(())).unwrap();
        let request = server.call(request).unwrap();
        assert_eq!(
            principal(&request).unwrap(),
            Principal::Node("n1".to_string())
        );
    }

    #[test]
    fn missing_or_bad_credentials_are_unauthenticated() {
        let mut server = AuthInterceptor::new(authority());
        let err = server.call(Request::new(())).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);

        let mut injector = CredentialInjector::with_token("alice", "not-a-token");
        let request = injector.call(Request::new(())).unwrap();
        let err = server.call(request).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }

    #[test]
    fn token_for_another_user_is_rejected() {
        let authority = authority();
        let token = authority
            .issue("alice", Duration::from_secs(30), Utc::now())
            .unwrap();
        let mut injector = CredentialInjector::with_token("root", token);
        let mut server = AuthInterceptor::new(authority);
        let request = injector.call(Request::new(())).unwrap();
        assert!(server.call(request).is_err());
    }

    #[test]
    fn requests_without_interceptor_have_no_principal() {
        assert!(principal(&Request::new(())).is_err());
    }
}

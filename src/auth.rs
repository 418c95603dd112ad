//! HS256 shared-secret tokens.
//!
//! Tokens use the compact JWS layout, `header.claims.signature`, each part
//! base64url without padding. The claims carry only the subject and the
//! issue/expiry times. Whoever holds the signing key can both mint and verify
//! tokens, so the key never leaves the controller, the agents and the
//! administrators' issuing tool.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Result, WlmError};

type HmacSha256 = Hmac<Sha256>;

pub const MIN_KEY_LEN: usize = 32;
pub const CONTROLLER_SUBJECT: &str = "wlm-controller";
pub const NODE_SUBJECT_PREFIX: &str = "node:";

/// Metadata / header names carrying the asserted identity and its token.
pub const USER_NAME_HEADER: &str = "x-wlm-user-name";
pub const USER_TOKEN_HEADER: &str = "x-wlm-user-token";

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// The symmetric signing secret.
#[derive(Clone)]
pub struct SigningKey(Vec<u8>);

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKey({} bytes)", self.0.len())
    }
}

impl SigningKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() < MIN_KEY_LEN {
            return Err(WlmError::Config(format!(
                "signing key must be at least {MIN_KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            WlmError::Config(format!("cannot read key file {}: {e}", path.display()))
        })?;
        Self::new(bytes)
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.0).map_err(|e| WlmError::Internal(e.to_string()))
    }
}

/// Who a verified request acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    User { name: String, admin: bool },
    Node(String),
    Controller,
}

impl Principal {
    pub fn name(&self) -> String {
        match self {
            Principal::User { name, .. } => name.clone(),
            Principal::Node(id) => format!("{NODE_SUBJECT_PREFIX}{id}"),
            Principal::Controller => CONTROLLER_SUBJECT.to_string(),
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Principal::User { admin: true, .. })
    }

    /// Owners may act on their own jobs; admins on any job.
    pub fn may_manage_job(&self, owner: &str) -> bool {
        match self {
            Principal::User { name, admin } => *admin || name == owner,
            Principal::Controller => true,
            Principal::Node(_) => false,
        }
    }

    pub fn require_admin(&self) -> Result<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(WlmError::PermissionDenied(format!(
                "{} is not an administrator",
                self.name()
            )))
        }
    }

    /// Node protocol calls must come from the node itself (or an admin).
    pub fn require_node(&self, node_id: &str) -> Result<()> {
        match self {
            Principal::Node(id) if id == node_id => Ok(()),
            p if p.is_admin() => Ok(()),
            p => Err(WlmError::PermissionDenied(format!(
                "{} may not act for node {node_id}",
                p.name()
            ))),
        }
    }

    pub fn require_controller(&self) -> Result<()> {
        match self {
            Principal::Controller => Ok(()),
            p if p.is_admin() => Ok(()),
            p => Err(WlmError::PermissionDenied(format!(
                "{} is not the controller",
                p.name()
            ))),
        }
    }
}

/// Issues and verifies tokens with one shared key.
#[derive(Debug, Clone)]
pub struct TokenAuthority {
    key: SigningKey,
    admins: BTreeSet<String>,
}

impl TokenAuthority {
    pub fn new(key: SigningKey) -> Self {
        Self {
            key,
            admins: BTreeSet::new(),
        }
    }

    pub fn with_admins(mut self, admins: impl IntoIterator<Item = String>) -> Self {
        self.admins = admins.into_iter().collect();
        self
    }

    pub fn issue(&self, subject: &str, lifetime: Duration, now: DateTime<Utc>) -> Result<String> {
        if subject.is_empty() {
            return Err(WlmError::Unauthorized("empty subject".to_string()));
        }
        let lifetime = chrono::Duration::from_std(lifetime)
            .map_err(|e| WlmError::Config(format!("token lifetime out of range: {e}")))?;
        let claims = Claims {
            sub: subject.to_string(),
            iat: now.timestamp(),
            exp: (now + lifetime).timestamp(),
        };
        let header = Header {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        };
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
        );
        let mut mac = self.key.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{signing_input}.{signature}"))
    }

    /// Check signature, algorithm and expiry.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Claims> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(claims_b64), Some(sig_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(WlmError::Unauthorized("malformed token".to_string()));
        };

        let signature = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| WlmError::Unauthorized("malformed signature".to_string()))?;
        let mut mac = self.key.mac()?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| WlmError::Unauthorized("bad signature".to_string()))?;

        let header: Header = decode_part(header_b64)?;
        if header.alg != "HS256" {
            return Err(WlmError::Unauthorized(format!(
                "unsupported algorithm {}",
                header.alg
            )));
        }
        let claims: Claims = decode_part(claims_b64)?;
        if now.timestamp() >= claims.exp {
            return Err(WlmError::Unauthorized("token expired".to_string()));
        }
        Ok(claims)
    }

    /// Verify `token` and check it was issued to `user`.
    pub fn authenticate(&self, user: &str, token: &str, now: DateTime<Utc>) -> Result<Principal> {
        let claims = self.verify(token, now)?;
        if claims.sub != user {
            return Err(WlmError::Unauthorized(
                "token subject does not match user".to_string(),
            ));
        }
        Ok(self.principal_for(&claims.sub))
    }

    pub fn principal_for(&self, subject: &str) -> Principal {
        if subject == CONTROLLER_SUBJECT {
            Principal::Controller
        } else if let Some(id) = subject.strip_prefix(NODE_SUBJECT_PREFIX) {
            Principal::Node(id.to_string())
        } else {
            Principal::User {
                name: subject.to_string(),
                admin: self.admins.contains(subject),
            }
        }
    }
}

fn decode_part<T: serde::de::DeserializeOwned>(part: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|_| WlmError::Unauthorized("malformed token".to_string()))?;
    serde_json::from_slice(&bytes).map_err(|_| WlmError::Unauthorized("malformed token".to_string()))
}

/// Subject used by a node agent.
pub fn node_subject(node_id: &str) -> String {
    format!("{NODE_SUBJECT_PREFIX}{node_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority() -> TokenAuthority {
        TokenAuthority::new(SigningKey::new(vec![7u8; 32]).unwrap())
            .with_admins(["root".to_string()])
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn issued_token_verifies_until_expiry() {
        let auth = authority();
        let token = auth.issue("alice", Duration::from_secs(60), now()).unwrap();

        let claims = auth.verify(&token, now()).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.exp - claims.iat, 60);

        let later = now() + chrono::Duration::seconds(59);
        assert!(auth.verify(&token, later).is_ok());
        let expired = now() + chrono::Duration::seconds(60);
        assert!(matches!(
            auth.verify(&token, expired),
            Err(WlmError::Unauthorized(_))
        ));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let token = authority()
            .issue("alice", Duration::from_secs(60), now())
            .unwrap();
        let other = TokenAuthority::new(SigningKey::new(vec![9u8; 32]).unwrap());
        assert!(other.verify(&token, now()).is_err());
    }

    #[test]
    fn tampered_claims_are_rejected() {
        let auth = authority();
        let token = auth.issue("alice", Duration::from_secs(60), now()).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let forged_claims = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&Claims {
                sub: "root".into(),
                iat: now().timestamp(),
                exp: now().timestamp() + 600,
            })
            .unwrap(),
        );
        let forged = format!("{}.{}.{}", parts[0], forged_claims, parts[2]);
        assert!(auth.verify(&forged, now()).is_err());
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let auth = authority();
        for token in ["", "a.b", "a.b.c.d", "!!.??.**"] {
            assert!(matches!(
                auth.verify(token, now()),
                Err(WlmError::Unauthorized(_))
            ));
        }
    }

    #[test]
    fn subject_must_match_asserted_user() {
        let auth = authority();
        let token = auth.issue("alice", Duration::from_secs(60), now()).unwrap();
        assert!(auth.authenticate("bob", &token, now()).is_err());
        assert_eq!(
            auth.authenticate("alice", &token, now()).unwrap(),
            Principal::User {
                name: "alice".into(),
                admin: false
            }
        );
    }

    #[test]
    fn principals_from_subjects() {
        let auth = authority();
        assert!(auth.principal_for("root").is_admin());
        assert_eq!(auth.principal_for("node:n7"), Principal::Node("n7".into()));
        assert_eq!(auth.principal_for(CONTROLLER_SUBJECT), Principal::Controller);
    }

    #[test]
    fn permission_checks() {
        let alice = Principal::User {
            name: "alice".into(),
            admin: false,
        };
        let root = Principal::User {
            name: "root".into(),
            admin: true,
        };
        assert!(alice.may_manage_job("alice"));
        assert!(!alice.may_manage_job("bob"));
        assert!(root.may_manage_job("bob"));
        assert!(alice.require_admin().is_err());
        assert!(Principal::Node("n1".into()).require_node("n1").is_ok());
        assert!(Principal::Node("n1".into()).require_node("n2").is_err());
        assert!(Principal::Controller.require_controller().is_ok());
        assert!(alice.require_controller().is_err());
    }

    #[test]
    fn short_keys_are_refused() {
        assert!(matches!(
            SigningKey::new(vec![1u8; 16]),
            Err(WlmError::Config(_))
        ));
    }
}

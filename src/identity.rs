// src/identity.rs
//! Voter identity resolution.
//!
//! A voter is identified by an optional authenticated user id and a SHA-256 hash
//! of the client address. Raw addresses never leave this module.

use std::net::{IpAddr, SocketAddr};

use http::{header::AUTHORIZATION, HeaderMap};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::models::RecordedVoter;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Claims carried by bearer tokens issued by the auth service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub id: i64,
    pub username: String,
    pub exp: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoterIdentity {
    pub user_id: Option<i64>,
    pub address_hash: String,
}

impl VoterIdentity {
    /// True when either signal matches a previously recorded voter.
    pub fn matches(&self, prior: &RecordedVoter) -> bool {
        let same_user = self.user_id.is_some() && prior.user_id == self.user_id;
        let same_address = prior.address_hash.as_deref() == Some(self.address_hash.as_str());
        same_user || same_address
    }

    pub fn to_recorded(&self) -> RecordedVoter {
        RecordedVoter {
            user_id: self.user_id,
            address_hash: Some(self.address_hash.clone()),
        }
    }
}

pub struct IdentityResolver {
    key: DecodingKey,
    validation: Validation,
    trust_forwarded_for: bool,
}

impl IdentityResolver {
    pub fn new(secret: &str, trust_forwarded_for: bool) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
            trust_forwarded_for,
        }
    }

    pub fn resolve(&self, headers: &HeaderMap, peer: SocketAddr) -> VoterIdentity {
        let address = self.client_address(headers, peer);

        VoterIdentity {
            user_id: self.authenticated_user(headers),
            address_hash: hash_address(&address),
        }
    }

    /// Invalid or expired tokens degrade to an anonymous voter.
    fn authenticated_user(&self, headers: &HeaderMap) -> Option<i64> {
        let token = bearer_token(headers)?;

        match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => Some(data.claims.id),
            Err(e) => {
                debug!(error = %e, "ignoring unusable bearer token");
                None
            }
        }
    }

    fn client_address(&self, headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
        if self.trust_forwarded_for {
            let forwarded = headers
                .get(FORWARDED_FOR)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|v| v.trim().parse::<IpAddr>().ok());

            if let Some(addr) = forwarded {
                return addr;
            }
        }
        peer.ip()
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub fn hash_address(addr: &IpAddr) -> String {
    let digest = Sha256::digest(addr.to_string().as_bytes());
    hex::encode(digest)
}

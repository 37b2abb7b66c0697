use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chat_api::UserId;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;
use time::{Duration, OffsetDateTime};

/// Claims stored within issued JWTs. `sub` is the user id.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Authenticated caller attached to requests by the auth middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub id: UserId,
}

impl TryFrom<&Claims> for AuthUser {
    type Error = anyhow::Error;

    fn try_from(claims: &Claims) -> Result<Self> {
        let id = claims.sub.parse().context("subject is not a user id")?;
        Ok(Self { id })
    }
}

/// Persistent signing secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuthFile {
    jwt_secret: String,
    created_at: i64,
}

/// Load the signing secret from `path`, creating and persisting a random one
/// on first start.
pub async fn load_or_create_secret(path: &Path) -> Result<Vec<u8>> {
    if let Ok(bytes) = tokio::fs::read(path).await {
        let file: AuthFile = serde_json::from_slice(&bytes).context("invalid auth file")?;
        return STANDARD
            .decode(file.jwt_secret)
            .context("invalid jwt secret encoding");
    }
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    let file = AuthFile {
        jwt_secret: STANDARD.encode(&secret),
        created_at: OffsetDateTime::now_utc().unix_timestamp(),
    };
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(path, serde_json::to_vec(&file)?).await?;
    tracing::info!(path = %path.display(), "generated new token signing secret");
    Ok(secret)
}

/// Issue a JWT for a user valid for the provided duration.
pub fn issue_jwt(secret: &[u8], user_id: UserId, valid_for: Duration) -> Result<String> {
    let exp = (OffsetDateTime::now_utc() + valid_for).unix_timestamp() as usize;
    let claims = Claims {
        sub: user_id.to_string(),
        exp,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )?;
    Ok(token)
}

/// Verify a JWT and return its claims if valid.
pub fn verify_jwt(secret: &[u8], token: &str) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    if data.claims.exp < OffsetDateTime::now_utc().unix_timestamp() as usize {
        anyhow::bail!("expired");
    }
    Ok(data.claims)
}

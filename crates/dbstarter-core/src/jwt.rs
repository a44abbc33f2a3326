//! Authorization header for requests to database servers.

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;

const ISSUER: &str = "arangodb";

#[derive(Debug, Serialize)]
struct ServerClaims<'a> {
    iss: &'a str,
    server_id: &'a str,
}

/// `Authorization` header value signed with `secret`, or an empty string
/// when no secret is configured.
pub fn create_jwt_authorization_header(
    secret: Option<&str>,
) -> Result<String, jsonwebtoken::errors::Error> {
    let secret = match secret {
        Some(s) if !s.is_empty() => s,
        _ => return Ok(String::new()),
    };
    let claims = ServerClaims {
        iss: ISSUER,
        server_id: "foo",
    };
    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(format!("bearer {token}"))
}

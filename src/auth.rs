use actix_web::{http::header::HeaderValue, HttpRequest};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::schemas::Session;

type HmacSha256 = Hmac<Sha256>;

/// What clients put in the `Authorization` header: the session fields plus a
/// hex HMAC over them.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct SessionHeader {
    account_id: String,
    email: String,
    member_id: String,
    name: String,
    hash: String,
}

pub fn session_from_request(request: &HttpRequest, secret: &str) -> Option<Session> {
    let authorization = request
        .headers()
        .get(actix_web::http::header::AUTHORIZATION)
        .map(HeaderValue::to_str)?
        .ok()?;
    verify_session(authorization, secret)
}

pub fn verify_session(authorization: &str, secret: &str) -> Option<Session> {
    let header: SessionHeader = serde_json::from_str(authorization).ok()?;
    let hash = hex::decode(&header.hash).ok()?;
    let mut mac = keyed_mac(secret)?;
    mac.update(check_string(&header).as_bytes());
    mac.verify_slice(&hash).ok()?;

    Some(Session {
        account_id: header.account_id,
        email: header.email,
        member_id: Uuid::parse_str(&header.member_id).ok()?,
        name: header.name,
    })
}

/// Produce the header value a client would send for `session`.
pub fn sign_session(session: &Session, secret: &str) -> Option<String> {
    let mut header = SessionHeader {
        account_id: session.account_id.clone(),
        email: session.email.clone(),
        member_id: session.member_id.to_string(),
        name: session.name.clone(),
        hash: String::new(),
    };
    let mut mac = keyed_mac(secret)?;
    mac.update(check_string(&header).as_bytes());
    header.hash = hex::encode(mac.finalize().into_bytes());
    serde_json::to_string(&header).ok()
}

/// Sorted `key=value` lines over every field but the hash.
fn check_string(header: &SessionHeader) -> String {
    [
        ("account_id", &header.account_id),
        ("email", &header.email),
        ("member_id", &header.member_id),
        ("name", &header.name),
    ]
    .iter()
    .map(|(key, value)| format!("{key}={value}"))
    .collect::<Vec<_>>()
    .join("\n")
}

fn keyed_mac(secret: &str) -> Option<HmacSha256> {
    let key = Sha256::digest(secret.as_bytes());
    HmacSha256::new_from_slice(&key).ok()
}

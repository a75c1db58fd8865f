use std::collections::HashSet;
use std::sync::OnceLock;

use ammonia::Builder;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::core::errors::{SyncError, SyncResult};
use crate::remote::{Document, Snapshot};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    use argon2::PasswordHash;

    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

/// Strips every HTML tag, leaving plain text.
pub fn sanitize_text(text: &str) -> String {
    Builder::default()
        .tags(HashSet::new())
        .clean(text.trim())
        .to_string()
}

fn url_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^https?://[^\s]+$").expect("Regex should compile"))
}

pub fn is_http_url(value: &str) -> bool {
    url_regex().is_match(value)
}

/// Part of an email address before the `@`.
pub fn email_local_part(email: &str) -> &str {
    email.split('@').next().unwrap_or(email)
}

pub fn to_document<T: Serialize>(value: &T) -> SyncResult<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(SyncError::Data(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

/// Decodes a stored document, mirroring the store-assigned id into `id_field`.
pub fn from_snapshot<T: DeserializeOwned>(snapshot: &Snapshot, id_field: &str) -> SyncResult<T> {
    let mut data = snapshot.data.clone();
    data.insert(id_field.to_string(), Value::String(snapshot.id.clone()));
    Ok(serde_json::from_value(Value::Object(data))?)
}

/// Decodes every snapshot, skipping (and logging) the ones that do not fit `T`.
pub fn decode_all<T: DeserializeOwned>(snapshots: &[Snapshot], id_field: &str) -> Vec<T> {
    snapshots
        .iter()
        .filter_map(|snap| match from_snapshot::<T>(snap, id_field) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!(id = %snap.id, error = %e, "skipping malformed document");
                None
            }
        })
        .collect()
}

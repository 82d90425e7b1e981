//! Session identity and the store contract consumed by the transport.
//!
//! The core never inspects a session beyond attaching it to a socket; the
//! store decides how it is persisted between requests. `CookieStore` keeps the
//! whole session in a signed cookie.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use hyper::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::SessionError;

type HmacSha256 = Hmac<Sha256>;

/// Default name of the session cookie.
pub const SESSION_COOKIE: &str = "_ls";

/// Identity token plus arbitrary key/value data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub values: HashMap<String, JsonValue>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Create a fresh session with a random identity.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            values: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: JsonValue) {
        self.values.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<JsonValue> {
        self.values.remove(key)
    }

    /// Replace the full value set, keeping the identity.
    pub fn replace_values(&mut self, values: HashMap<String, JsonValue>) {
        self.values = values;
    }
}

/// Storage for sessions across requests and reconnects.
///
/// `get` either returns a usable session (fresh when none is stored) or a
/// distinguishable [`SessionError::Corrupt`]; it never hands back partially
/// decoded data.
pub trait SessionStore: Send + Sync {
    fn get(&self, request: &HeaderMap) -> Result<Session, SessionError>;

    fn save(
        &self,
        response: &mut HeaderMap,
        request: &HeaderMap,
        session: &Session,
    ) -> Result<(), SessionError>;

    fn clear(&self, response: &mut HeaderMap, request: &HeaderMap) -> Result<(), SessionError>;
}

/// Session store that keeps the session in an HMAC-signed cookie.
pub struct CookieStore {
    name: String,
    key: Vec<u8>,
}

impl CookieStore {
    pub fn new(name: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn mac(&self) -> Result<HmacSha256, SessionError> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| SessionError::Encode(e.to_string()))
    }

    /// Encode a session as `payload.signature`, both base64url.
    pub fn encode(&self, session: &Session) -> Result<String, SessionError> {
        let json = serde_json::to_vec(session).map_err(|e| SessionError::Encode(e.to_string()))?;
        let payload = URL_SAFE_NO_PAD.encode(json);

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{}.{}", payload, signature))
    }

    pub fn decode(&self, value: &str) -> Result<Session, SessionError> {
        let (payload, signature) = value
            .split_once('.')
            .ok_or_else(|| SessionError::corrupt("missing signature"))?;

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| SessionError::corrupt(format!("bad signature encoding: {}", e)))?;
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| SessionError::corrupt("signature mismatch"))?;

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| SessionError::corrupt(format!("bad payload encoding: {}", e)))?;
        serde_json::from_slice(&json)
            .map_err(|e| SessionError::corrupt(format!("bad payload: {}", e)))
    }

    fn set_cookie(&self, response: &mut HeaderMap, cookie: String) -> Result<(), SessionError> {
        let value =
            HeaderValue::from_str(&cookie).map_err(|e| SessionError::Encode(e.to_string()))?;
        response.append(SET_COOKIE, value);
        Ok(())
    }
}

impl SessionStore for CookieStore {
    fn get(&self, request: &HeaderMap) -> Result<Session, SessionError> {
        match find_cookie(request, &self.name) {
            Some(value) => self.decode(&value),
            None => Ok(Session::new()),
        }
    }

    fn save(
        &self,
        response: &mut HeaderMap,
        _request: &HeaderMap,
        session: &Session,
    ) -> Result<(), SessionError> {
        let encoded = self.encode(session)?;
        self.set_cookie(
            response,
            format!("{}={}; Path=/; HttpOnly; SameSite=Strict", self.name, encoded),
        )
    }

    fn clear(&self, response: &mut HeaderMap, _request: &HeaderMap) -> Result<(), SessionError> {
        self.set_cookie(
            response,
            format!(
                "{}=; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Max-Age=0; HttpOnly",
                self.name
            ),
        )
    }
}

/// Find a cookie value by name across all `Cookie` headers.
pub fn find_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> CookieStore {
        CookieStore::new(SESSION_COOKIE, b"test-signing-key".to_vec())
    }

    fn request_with(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(cookie).unwrap());
        headers
    }

    #[test]
    fn test_missing_cookie_creates_fresh_session() {
        let session = store().get(&HeaderMap::new()).unwrap();
        assert!(!session.id.is_empty());
        assert!(session.values.is_empty());
    }

    #[test]
    fn test_saved_session_is_read_back() {
        let store = store();
        let mut session = Session::new();
        session.set("user", json!("ada"));

        let mut response = HeaderMap::new();
        store.save(&mut response, &HeaderMap::new(), &session).unwrap();
        let set_cookie = response.get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(set_cookie.contains("HttpOnly"));
        let pair = set_cookie.split(';').next().unwrap();

        let restored = store.get(&request_with(&format!("theme=dark; {}", pair))).unwrap();
        assert_eq!(restored, session);
    }

    #[test]
    fn test_tampered_cookie_is_corrupt() {
        let store = store();
        let encoded = store.encode(&Session::new()).unwrap();
        let tampered = format!("x{}", encoded);

        let err = store
            .get(&request_with(&format!("{}={}", SESSION_COOKIE, tampered)))
            .unwrap_err();
        assert!(err.is_corrupt());

        let err = store
            .get(&request_with(&format!("{}=garbage", SESSION_COOKIE)))
            .unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_other_key_cannot_read_session() {
        let encoded = store().encode(&Session::new()).unwrap();
        let other = CookieStore::new(SESSION_COOKIE, b"another-key".to_vec());
        assert!(other.decode(&encoded).unwrap_err().is_corrupt());
    }

    #[test]
    fn test_clear_expires_cookie() {
        let mut response = HeaderMap::new();
        store().clear(&mut response, &HeaderMap::new()).unwrap();
        let value = response.get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(value.starts_with("_ls=;"));
        assert!(value.contains("Max-Age=0"));
    }

    #[test]
    fn test_replace_values_keeps_identity() {
        let mut session = Session::new();
        let id = session.id.clone();
        session.set("a", json!(1));
        session.replace_values(HashMap::from([("b".to_string(), json!(2))]));
        assert_eq!(session.id, id);
        assert!(session.get("a").is_none());
        assert_eq!(session.get("b"), Some(&json!(2)));
    }
}

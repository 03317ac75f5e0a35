use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::broker::build_header;
use super::AuthError;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// OpenID identity returned by the SSO at login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub identity_url: Option<String>,
    pub nickname: Option<String>,
    pub fullname: Option<String>,
    pub image: Option<String>,
    pub email: Option<String>,
}

/// Serialized root and discharge macaroons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub root: String,
    pub discharge: String,
}

/// Per-user session state. Any session backend (cookie, file) carries this
/// value; it is only mutated by the request that owns it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "openid")]
    pub identity: Option<Identity>,
    pub macaroon_root: Option<String>,
    pub macaroon_discharge: Option<String>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// First login step: the root macaroon is stored before the SSO
    /// discharges its caveat.
    pub fn set_root(&mut self, root: String) {
        self.macaroon_root = Some(root);
    }

    /// Second login step.
    pub fn complete_login(&mut self, identity: Identity, discharge: String) {
        self.identity = Some(identity);
        self.macaroon_discharge = Some(discharge);
    }

    pub fn set_discharge(&mut self, discharge: String) {
        self.macaroon_discharge = Some(discharge);
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some() && self.macaroon_root.is_some() && self.macaroon_discharge.is_some()
    }

    pub fn credentials(&self) -> Option<CredentialPair> {
        match (&self.macaroon_root, &self.macaroon_discharge) {
            (Some(root), Some(discharge)) => Some(CredentialPair {
                root: root.clone(),
                discharge: discharge.clone(),
            }),
            _ => None,
        }
    }

    /// `Authorization` header value for the stored pair.
    pub fn authorization_header(&self) -> Result<String, AuthError> {
        let pair = self.credentials().ok_or(AuthError::NotAuthenticated)?;
        build_header(&pair.root, &pair.discharge)
    }

    pub fn nickname(&self) -> Option<&str> {
        self.identity.as_ref().and_then(|i| i.nickname.as_deref())
    }

    /// Drop credentials and identity. Idempotent.
    pub fn clear(&mut self) {
        self.macaroon_root = None;
        self.macaroon_discharge = None;
        self.identity = None;
    }
}

/// Stores a `Session` as JSON in the cache directory.
pub struct SessionFile {
    cache_dir: PathBuf,
}

impl SessionFile {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    /// Load session from disk, or an empty session if none was saved
    pub fn load(&self) -> Result<Session> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(Session::default());
        }
        let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
        serde_json::from_str(&contents).context("Failed to parse session file")
    }

    /// Save session to disk
    pub fn save(&self, session: &Session) -> Result<()> {
        let path = self.session_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(session)?;
        std::fs::write(path, contents).context("Failed to write session file")?;
        Ok(())
    }

    /// Remove the saved session
    pub fn clear(&self) -> Result<()> {
        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn session_path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Macaroon;

    fn logged_in() -> Session {
        let root = Macaroon::new("store", "root-id", b"root-key").unwrap();
        let discharge = Macaroon::new("sso", "discharge-id", b"discharge-key").unwrap();
        let mut session = Session::new();
        session.set_root(root.serialize());
        session.complete_login(
            Identity {
                nickname: Some("toto".to_string()),
                ..Default::default()
            },
            discharge.serialize(),
        );
        session
    }

    #[test]
    fn test_is_authenticated_requires_all_fields() {
        let full = logged_in();
        assert!(full.is_authenticated());

        let mut no_identity = full.clone();
        no_identity.identity = None;
        assert!(!no_identity.is_authenticated());

        let mut no_root = full.clone();
        no_root.macaroon_root = None;
        assert!(!no_root.is_authenticated());

        let mut no_discharge = full;
        no_discharge.macaroon_discharge = None;
        assert!(!no_discharge.is_authenticated());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut session = logged_in();
        session.clear();
        assert_eq!(session, Session::default());
        session.clear();
        assert_eq!(session, Session::default());
    }

    #[test]
    fn test_authorization_header_without_credentials() {
        let session = Session::new();
        assert!(matches!(
            session.authorization_header(),
            Err(AuthError::NotAuthenticated)
        ));
    }

    #[test]
    fn test_session_serializes_with_openid_key() {
        let json = serde_json::to_value(logged_in()).unwrap();
        assert_eq!(json["openid"]["nickname"], "toto");
        assert!(json["macaroon_root"].is_string());
    }

    #[test]
    fn test_session_file_roundtrip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let file = SessionFile::new(dir.path().to_path_buf());

        assert_eq!(file.load().unwrap(), Session::default());

        let session = logged_in();
        file.save(&session).unwrap();
        assert_eq!(file.load().unwrap(), session);

        file.clear().unwrap();
        assert_eq!(file.load().unwrap(), Session::default());
        // Clearing twice is fine
        file.clear().unwrap();
    }
}

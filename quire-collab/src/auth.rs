//! Identity and access checks made once per connection.
//!
//! The gateway never decides who a user is or what they may open. It asks an
//! [`Authenticator`] for the identity behind the connect request and an
//! [`AccessControl`] whether that identity may open a document-scoped room.
//! Both may block (e.g. on a user database) and are called off the runtime.
//!
//! [`StaticDirectory`] implements both from the server's TOML configuration.

use std::collections::HashMap;

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::http::{header, Request};

/// Query parameter carrying the bearer token.
pub const TOKEN_QUERY_PARAM: &str = "token";
/// Cookie naming an already established web session.
pub const SESSION_COOKIE: &str = "sessionid";

const TOKEN_PREFIXES: &[&str] = &["token ", "bearer "];

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub user_id: String,
    pub name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
        }
    }
}

/// Resolves credentials to identities.
pub trait Authenticator: Send + Sync {
    /// Identity behind a bearer token, without any scheme prefix.
    fn authenticate(&self, token: &str) -> Option<Identity>;

    /// Identity of an existing web session, used when no token resolves.
    fn resolve_session(&self, _session_id: &str) -> Option<Identity> {
        None
    }
}

/// Document-level permission check.
pub trait AccessControl: Send + Sync {
    fn has_access(&self, document_id: &str, user: &Identity) -> bool;
}

/// What the gateway needs from the HTTP upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Raw (percent-decoded) room identifier from the path.
    pub room: String,
    pub token: Option<String>,
    pub session_id: Option<String>,
}

impl ConnectRequest {
    /// Parse an upgrade request addressed to `<route_prefix><room>`.
    ///
    /// Returns `None` when the path is outside the route or names no room.
    pub fn from_http<B>(request: &Request<B>, route_prefix: &str) -> Option<Self> {
        let raw_room = request.uri().path().strip_prefix(route_prefix)?;
        let room = percent_decode_str(raw_room.trim_end_matches('/'))
            .decode_utf8()
            .ok()?
            .into_owned();
        if room.is_empty() {
            return None;
        }

        let headers = request.headers();
        let query_token = request.uri().query().and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(name, _)| name == TOKEN_QUERY_PARAM)
                .and_then(|(_, value)| normalize_token(&value))
        });
        let header_token = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(normalize_token);
        let session_id = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(|cookies| cookie_value(cookies, SESSION_COOKIE));

        Some(Self {
            room,
            token: query_token.or(header_token),
            session_id,
        })
    }
}

/// Strip an optional `Token ` / `Bearer ` scheme (any case) and surrounding space.
pub fn normalize_token(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let token = TOKEN_PREFIXES
        .iter()
        .find_map(|prefix| {
            raw.get(..prefix.len())
                .filter(|head| head.eq_ignore_ascii_case(prefix))
                .map(|_| &raw[prefix.len()..])
        })
        .unwrap_or(raw)
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn cookie_value(cookies: &str, name: &str) -> Option<String> {
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name && !value.is_empty()).then(|| value.to_string())
    })
}

/// Token first, then the session fallback.
pub fn resolve_identity(auth: &dyn Authenticator, request: &ConnectRequest) -> Option<Identity> {
    request
        .token
        .as_deref()
        .and_then(|token| auth.authenticate(token))
        .or_else(|| {
            request
                .session_id
                .as_deref()
                .and_then(|session| auth.resolve_session(session))
        })
}

// ─── Static directory ─────────────────────────────────────────────

/// Users and document permissions, as written in the server config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub users: Vec<UserEntry>,
    pub documents: Vec<DocumentEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserEntry {
    pub id: String,
    pub name: String,
    pub tokens: Vec<String>,
    pub sessions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentEntry {
    pub id: String,
    pub owner: String,
    pub collaborators: Vec<String>,
}

/// In-memory [`Authenticator`] and [`AccessControl`].
#[derive(Debug, Default)]
pub struct StaticDirectory {
    tokens: HashMap<String, Identity>,
    sessions: HashMap<String, Identity>,
    documents: HashMap<String, DocumentEntry>,
}

impl StaticDirectory {
    pub fn from_config(config: &DirectoryConfig) -> Self {
        let mut directory = Self::default();
        for user in &config.users {
            let identity = Identity::new(&user.id, &user.name);
            for token in &user.tokens {
                directory.tokens.insert(token.clone(), identity.clone());
            }
            for session in &user.sessions {
                directory.sessions.insert(session.clone(), identity.clone());
            }
        }
        for document in &config.documents {
            directory
                .documents
                .insert(document.id.clone(), document.clone());
        }
        directory
    }
}

impl Authenticator for StaticDirectory {
    fn authenticate(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).cloned()
    }

    fn resolve_session(&self, session_id: &str) -> Option<Identity> {
        self.sessions.get(session_id).cloned()
    }
}

impl AccessControl for StaticDirectory {
    /// Owner or collaborator. Unknown documents are denied.
    fn has_access(&self, document_id: &str, user: &Identity) -> bool {
        self.documents.get(document_id).is_some_and(|document| {
            document.owner == user.user_id || document.collaborators.contains(&user.user_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> StaticDirectory {
        StaticDirectory::from_config(&DirectoryConfig {
            users: vec![
                UserEntry {
                    id: "u1".into(),
                    name: "alice".into(),
                    tokens: vec!["tok-alice".into()],
                    sessions: vec!["sess-alice".into()],
                },
                UserEntry {
                    id: "u2".into(),
                    name: "bob".into(),
                    tokens: vec!["tok-bob".into()],
                    sessions: vec![],
                },
                UserEntry {
                    id: "u3".into(),
                    name: "carol".into(),
                    tokens: vec!["tok-carol".into()],
                    sessions: vec![],
                },
            ],
            documents: vec![DocumentEntry {
                id: "abc".into(),
                owner: "u1".into(),
                collaborators: vec!["u2".into()],
            }],
        })
    }

    fn request(uri: &str) -> Request<()> {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[test]
    fn test_normalize_token() {
        assert_eq!(normalize_token("abc").as_deref(), Some("abc"));
        assert_eq!(normalize_token("Token abc").as_deref(), Some("abc"));
        assert_eq!(normalize_token("token  abc ").as_deref(), Some("abc"));
        assert_eq!(normalize_token("BEARER xyz").as_deref(), Some("xyz"));
        assert_eq!(normalize_token(""), None);
        assert_eq!(normalize_token("   "), None);
        // Multi-byte input shorter than a prefix must not panic.
        assert_eq!(normalize_token("é").as_deref(), Some("é"));
    }

    #[test]
    fn test_parse_room_and_query_token() {
        let req = request("/ws/yjs/page%3Aabc/?token=Token%20tok-alice");
        let parsed = ConnectRequest::from_http(&req, "/ws/yjs/").unwrap();
        assert_eq!(parsed.room, "page:abc");
        assert_eq!(parsed.token.as_deref(), Some("tok-alice"));
        assert_eq!(parsed.session_id, None);
    }

    #[test]
    fn test_query_token_wins_over_header() {
        let req = Request::builder()
            .uri("/ws/yjs/lobby?token=from-query")
            .header("Authorization", "Bearer from-header")
            .body(())
            .unwrap();
        let parsed = ConnectRequest::from_http(&req, "/ws/yjs/").unwrap();
        assert_eq!(parsed.token.as_deref(), Some("from-query"));

        let req = Request::builder()
            .uri("/ws/yjs/lobby")
            .header("Authorization", "Bearer from-header")
            .body(())
            .unwrap();
        let parsed = ConnectRequest::from_http(&req, "/ws/yjs/").unwrap();
        assert_eq!(parsed.token.as_deref(), Some("from-header"));
    }

    #[test]
    fn test_session_cookie() {
        let req = Request::builder()
            .uri("/ws/yjs/lobby")
            .header("Cookie", "csrftoken=x; sessionid=sess-alice")
            .body(())
            .unwrap();
        let parsed = ConnectRequest::from_http(&req, "/ws/yjs/").unwrap();
        assert_eq!(parsed.session_id.as_deref(), Some("sess-alice"));
        assert_eq!(parsed.token, None);
    }

    #[test]
    fn test_outside_route() {
        assert!(ConnectRequest::from_http(&request("/other/room"), "/ws/yjs/").is_none());
        assert!(ConnectRequest::from_http(&request("/ws/yjs/"), "/ws/yjs/").is_none());
    }

    #[test]
    fn test_resolve_identity_precedence() {
        let dir = directory();
        let by_token = ConnectRequest {
            room: "lobby".into(),
            token: Some("tok-bob".into()),
            session_id: Some("sess-alice".into()),
        };
        assert_eq!(resolve_identity(&dir, &by_token).unwrap().name, "bob");

        // A bad token falls back to the session.
        let fallback = ConnectRequest {
            token: Some("bogus".into()),
            ..by_token.clone()
        };
        assert_eq!(resolve_identity(&dir, &fallback).unwrap().name, "alice");

        let anonymous = ConnectRequest {
            room: "lobby".into(),
            ..Default::default()
        };
        assert!(resolve_identity(&dir, &anonymous).is_none());
    }

    #[test]
    fn test_access() {
        let dir = directory();
        let alice = dir.authenticate("tok-alice").unwrap();
        let bob = dir.authenticate("tok-bob").unwrap();
        let carol = dir.authenticate("tok-carol").unwrap();

        assert!(dir.has_access("abc", &alice));
        assert!(dir.has_access("abc", &bob));
        assert!(!dir.has_access("abc", &carol));
        assert!(!dir.has_access("missing", &alice));
    }
}

//! CONNECT authentication/authorization
//!
//! Mirrors the CLI surface in the spec: an optional credential whitelist, an
//! anonymous-allowed flag, and an ignore-credentials escape hatch. Standardises
//! on `user:pass` as the whitelist entry separator and rejects the legacy
//! `user;pass` form at startup (see the spec's resolved open question).

use std::collections::HashMap;
use std::fmt;

use crate::protocol::{Connect, ConnectReturnCode};

/// A configuration error raised while parsing broker CLI flags. Distinct
/// from [`crate::channel::ChannelError`]: this fails synchronously at
/// startup, before any channel exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// `-u` was given with no argument, or an entry wasn't `user:pass`.
    MalformedCredentialList(String),
    /// An entry used the legacy `;` separator instead of `:`.
    LegacySeparatorRejected(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedCredentialList(s) => {
                write!(f, "malformed -u credential list: {s:?}")
            }
            Self::LegacySeparatorRejected(s) => write!(
                f,
                "credential entry {s:?} uses the legacy ';' separator; use 'user:pass'"
            ),
        }
    }
}

impl std::error::Error for AuthError {}

/// Resolved authentication policy for the broker.
#[derive(Debug, Clone, Default)]
pub struct Auth {
    allow_anonymous: bool,
    ignore_credentials: bool,
    whitelist: HashMap<String, String>,
}

impl Auth {
    pub fn new(allow_anonymous: bool, ignore_credentials: bool) -> Self {
        Self {
            allow_anonymous,
            ignore_credentials,
            whitelist: HashMap::new(),
        }
    }

    /// Parses a `-u` argument: `user1:pass1,user2:pass2`. Empty input or a
    /// `;`-separated entry is a configuration error.
    pub fn with_credentials(mut self, spec: &str) -> Result<Self, AuthError> {
        if spec.trim().is_empty() {
            return Err(AuthError::MalformedCredentialList(spec.to_string()));
        }
        for entry in spec.split(',') {
            if entry.contains(';') && !entry.contains(':') {
                return Err(AuthError::LegacySeparatorRejected(entry.to_string()));
            }
            let mut parts = entry.splitn(2, ':');
            let (user, pass) = match (parts.next(), parts.next()) {
                (Some(u), Some(p)) if !u.is_empty() => (u, p),
                _ => return Err(AuthError::MalformedCredentialList(entry.to_string())),
            };
            self.whitelist.insert(user.to_string(), pass.to_string());
        }
        Ok(self)
    }

    /// Decides the CONNACK return code for an inbound CONNECT per §6:
    /// ignore-credentials accepts unconditionally; otherwise a configured
    /// whitelist is checked, falling back to anonymous-allowed when the
    /// client presented no credentials.
    pub fn authorize(&self, connect: &Connect) -> ConnectReturnCode {
        if self.ignore_credentials {
            return ConnectReturnCode::Accepted;
        }

        match &connect.username {
            None => {
                if self.allow_anonymous && self.whitelist.is_empty() {
                    ConnectReturnCode::Accepted
                } else {
                    ConnectReturnCode::NotAuthorized
                }
            }
            Some(user) => {
                let presented = connect
                    .password
                    .as_ref()
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .unwrap_or_default();
                match self.whitelist.get(user) {
                    Some(expected) if expected == &presented => ConnectReturnCode::Accepted,
                    _ => ConnectReturnCode::BadCredentials,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn connect(username: Option<&str>, password: Option<&str>) -> Connect {
        Connect {
            client_id: "clientId".to_string(),
            clean_session: true,
            keep_alive: 60,
            username: username.map(str::to_string),
            password: password.map(|p| Bytes::from(p.to_string())),
            will: None,
            raw: Default::default(),
        }
    }

    #[test]
    fn no_allow_flag_and_no_whitelist_rejects_anonymous() {
        let auth = Auth::new(false, false);
        assert_eq!(
            auth.authorize(&connect(None, None)),
            ConnectReturnCode::NotAuthorized
        );
    }

    #[test]
    fn anonymous_allowed_without_whitelist() {
        let auth = Auth::new(true, false);
        assert_eq!(
            auth.authorize(&connect(None, None)),
            ConnectReturnCode::Accepted
        );
    }

    #[test]
    fn whitelist_rejects_mismatched_password() {
        let auth = Auth::new(false, false)
            .with_credentials("user1:pass1")
            .unwrap();
        assert_eq!(
            auth.authorize(&connect(Some("user1"), Some("pass2"))),
            ConnectReturnCode::BadCredentials
        );
    }

    #[test]
    fn whitelist_accepts_matching_credentials() {
        let auth = Auth::new(false, false)
            .with_credentials("user1:pass1")
            .unwrap();
        assert_eq!(
            auth.authorize(&connect(Some("user1"), Some("pass1"))),
            ConnectReturnCode::Accepted
        );
    }

    #[test]
    fn ignore_credentials_accepts_anything() {
        let auth = Auth::new(false, true);
        assert_eq!(
            auth.authorize(&connect(Some("whoever"), Some("wrong"))),
            ConnectReturnCode::Accepted
        );
    }

    #[test]
    fn empty_credential_list_is_a_configuration_error() {
        let err = Auth::new(false, false).with_credentials("");
        assert!(matches!(err, Err(AuthError::MalformedCredentialList(_))));
    }

    #[test]
    fn legacy_semicolon_separator_is_rejected() {
        let err = Auth::new(false, false).with_credentials("user1;pass1");
        assert!(matches!(err, Err(AuthError::LegacySeparatorRejected(_))));
    }
}

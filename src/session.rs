use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::Deserialize;

use crate::api::{self, ApiError, TokenProvider};
use crate::data::AuthService;
use crate::storage::{self, Account, Token};

/// Identity of the current viewer, threaded explicitly into whatever needs it.
pub trait AuthContext: Send + Sync {
    fn viewer(&self) -> Option<api::User>;

    fn is_authenticated(&self) -> bool {
        self.viewer().is_some()
    }

    /// Drops the current identity, e.g. after the backend rejected its token.
    fn invalidate(&self);
}

/// An `AuthContext` with nobody signed in.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

impl AuthContext for Anonymous {
    fn viewer(&self) -> Option<api::User> {
        None
    }

    fn invalidate(&self) {}
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("account not found")]
    AccountNotFound,
    #[error("not signed in")]
    NotSignedIn,
    #[error("username and password are required")]
    MissingCredentials,
}

/// Bearer token slot shared between the session manager and the API client.
#[derive(Debug, Default)]
pub struct Credentials {
    token: RwLock<Option<String>>,
}

impl Credentials {
    pub fn set(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    pub fn clear(&self) {
        self.set(None);
    }
}

impl TokenProvider for Credentials {
    fn token(&self) -> Option<String> {
        self.token.read().clone()
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub account: Account,
    pub user: api::User,
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct Manager {
    store: Arc<storage::Store>,
    auth: Arc<dyn AuthService>,
    credentials: Arc<Credentials>,
    active: RwLock<Option<Session>>,
}

impl Manager {
    pub fn new(
        store: Arc<storage::Store>,
        auth: Arc<dyn AuthService>,
        credentials: Arc<Credentials>,
    ) -> Self {
        Self {
            store,
            auth,
            credentials,
            active: RwLock::new(None),
        }
    }

    pub fn login(&self, username: &str, password: &str) -> Result<Session> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            bail!(SessionError::MissingCredentials);
        }
        let resp = self
            .auth
            .login(username, password)
            .map_err(|err| describe_auth_error(err, "sign in"))?;
        let session = self.adopt(resp)?;
        tracing::info!(username = %session.user.username, "signed in");
        Ok(session)
    }

    pub fn register(&self, username: &str, password: &str) -> Result<Session> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            bail!(SessionError::MissingCredentials);
        }
        let resp = self
            .auth
            .register(username, password)
            .map_err(|err| describe_auth_error(err, "register"))?;
        let session = self.adopt(resp)?;
        tracing::info!(username = %session.user.username, "registered");
        Ok(session)
    }

    /// Resumes the most recently used stored account whose token is still valid.
    pub fn load_existing(&self) -> Result<Option<Session>> {
        let now = Utc::now();
        for account in self.store.list_accounts()? {
            let Some(token) = self.store.get_token(account.id)? else {
                continue;
            };
            if token.is_expired(now) {
                tracing::debug!(username = %account.username, "skipping expired token");
                continue;
            }
            let session = Session {
                user: api::User {
                    id: account.user_id,
                    username: account.username.clone(),
                    date_joined: None,
                },
                account,
                token: token.access_token,
                expires_at: token.expires_at,
            };
            self.activate(session.clone());
            return Ok(Some(session));
        }
        Ok(None)
    }

    /// Confirms the active token with the backend. A rejected token is invalidated.
    pub fn verify(&self) -> Result<Option<api::User>> {
        if self.active.read().is_none() {
            return Ok(None);
        }
        match self.auth.me() {
            Ok(user) => {
                if let Some(session) = self.active.write().as_mut() {
                    session.user = user.clone();
                }
                Ok(Some(user))
            }
            Err(ApiError::Unauthorized) => {
                self.invalidate();
                Ok(None)
            }
            Err(err) => Err(err).context("verify session"),
        }
    }

    pub fn logout(&self) -> Result<()> {
        let session = self
            .active
            .write()
            .take()
            .ok_or(SessionError::NotSignedIn)?;
        self.credentials.clear();
        self.store
            .delete_token(session.account.id)
            .context("forget stored token")?;
        tracing::info!(username = %session.user.username, "signed out");
        Ok(())
    }

    fn adopt(&self, resp: api::AuthResponse) -> Result<Session> {
        let account_id = self
            .store
            .upsert_account(Account::new(resp.user.id, &resp.user.username))
            .context("save account")?;
        let account = self
            .store
            .get_account_by_id(account_id)?
            .ok_or(SessionError::AccountNotFound)?;
        let expires_at = token_expiry(&resp.token);
        self.store
            .upsert_token(Token {
                account_id,
                access_token: resp.token.clone(),
                expires_at,
            })
            .context("save token")?;
        let session = Session {
            account,
            user: resp.user,
            token: resp.token,
            expires_at,
        };
        self.activate(session.clone());
        Ok(session)
    }

    fn activate(&self, session: Session) {
        self.credentials.set(Some(session.token.clone()));
        *self.active.write() = Some(session);
    }
}

impl AuthContext for Manager {
    fn viewer(&self) -> Option<api::User> {
        self.active.read().as_ref().map(|session| session.user.clone())
    }

    fn invalidate(&self) {
        let Some(session) = self.active.write().take() else {
            return;
        };
        self.credentials.clear();
        tracing::warn!(username = %session.user.username, "session rejected by server, signing out");
        if let Err(err) = self.store.delete_token(session.account.id) {
            tracing::warn!("failed to forget rejected token: {err:#}");
        }
    }
}

fn describe_auth_error(err: ApiError, action: &str) -> anyhow::Error {
    match err.server_message() {
        Some(message) => anyhow::anyhow!("{action} failed: {message}"),
        None => anyhow::Error::new(err).context(format!("{action} failed")),
    }
}

#[derive(Deserialize)]
struct Claims {
    #[serde(default)]
    exp: Option<i64>,
}

/// Reads the `exp` claim of a JWT without verifying its signature.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    Utc.timestamp_opt(claims.exp?, 0).single()
}

//! Cookie authentication against a CouchDB-compatible `_session` endpoint.
//!
//! Used for `Credentials::Session`: the peer's `reqwest::Client` keeps a
//! cookie store, so once `login()` succeeds every later request from that
//! client carries the session cookie.

use reqwest::Client;
use serde::{Deserialize, Serialize};

use trellis_core::error::{Result, TrellisError};

use crate::{check_error, transport_error};

/// A `_session` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub ok: bool,
    #[serde(rename = "userCtx")]
    pub user_ctx: UserContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

pub struct AuthClient {
    client: Client,
    server_url: String,
}

impl AuthClient {
    /// Share `client` (and its cookie store) with the caller.
    pub fn with_client(server_url: &str, client: Client) -> Self {
        Self {
            client,
            server_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Session> {
        let resp = self
            .client
            .post(format!("{}/_session", self.server_url))
            .json(&serde_json::json!({"name": username, "password": password}))
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_error(resp).await?;
        let session: Session = resp.json().await.map_err(transport_error)?;
        tracing::debug!(server = %self.server_url, user = ?session.user_ctx.name, "session login");
        Ok(session)
    }

    pub async fn logout(&self) -> Result<()> {
        let resp = self
            .client
            .delete(format!("{}/_session", self.server_url))
            .send()
            .await
            .map_err(transport_error)?;
        check_error(resp).await?;
        Ok(())
    }

    pub async fn get_session(&self) -> Result<Session> {
        let resp = self
            .client
            .get(format!("{}/_session", self.server_url))
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_error(resp).await?;
        resp.json::<Session>().await.map_err(transport_error)
    }
}

/// Server root of a database URL: everything before the last path segment.
pub(crate) fn server_root(db_url: &str) -> Result<String> {
    let trimmed = db_url.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((root, db)) if !db.is_empty() && root.contains("://") && !root.ends_with('/') => {
            Ok(root.to_string())
        }
        _ => Err(TrellisError::BadRequest(format!(
            "URL has no database path: {db_url}"
        ))),
    }
}

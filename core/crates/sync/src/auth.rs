use std::{fmt, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl From<String> for UserId {
	fn from(id: String) -> Self {
		Self(id)
	}
}

impl From<&str> for UserId {
	fn from(id: &str) -> Self {
		Self(id.to_string())
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Clone, Serialize, Deserialize)]
pub enum Credentials {
	Anonymous,
	EmailPassword { email: String, password: String },
	ApiKey(String),
	Jwt(String),
}

impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Anonymous => write!(f, "Anonymous"),
			Self::EmailPassword { email, .. } => f
				.debug_struct("EmailPassword")
				.field("email", email)
				.field("password", &"<REDACTED>")
				.finish(),
			Self::ApiKey(_) => write!(f, "ApiKey(<REDACTED>)"),
			Self::Jwt(_) => write!(f, "Jwt(<REDACTED>)"),
		}
	}
}

#[derive(Clone, Serialize, Deserialize)]
pub struct UserTokens {
	pub user_id: UserId,
	pub access_token: String,
	pub refresh_token: String,
}

impl fmt::Debug for UserTokens {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("UserTokens")
			.field("user_id", &self.user_id)
			.field("access_token", &"<REDACTED>")
			.field("refresh_token", &"<REDACTED>")
			.finish()
	}
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
	#[error("invalid credentials")]
	InvalidCredentials,
	#[error("refresh token rejected for <user_id='{0}'>")]
	RefreshRejected(UserId),
	#[error("authentication provider failure: {0}")]
	Provider(String),
}

/// Token exchange with the sync service.
#[async_trait]
pub trait AuthProvider: Send + Sync + 'static {
	async fn login(&self, credentials: &Credentials) -> Result<UserTokens, AuthError>;

	async fn refresh_access_token(
		&self,
		user_id: &UserId,
		refresh_token: &str,
	) -> Result<String, AuthError>;
}

/// Access token handed to a transport when it opens a session.
#[derive(Clone)]
pub struct SessionAuth {
	pub user_id: UserId,
	pub access_token: String,
}

impl fmt::Debug for SessionAuth {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SessionAuth")
			.field("user_id", &self.user_id)
			.field("access_token", &"<REDACTED>")
			.finish()
	}
}

/// A logged in user, owner of every session opened on its behalf.
pub struct User {
	tokens: RwLock<UserTokens>,
	provider: Arc<dyn AuthProvider>,
}

impl fmt::Debug for User {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("User")
			.field("id", &self.tokens.read().user_id)
			.finish_non_exhaustive()
	}
}

impl User {
	#[instrument(skip_all, err)]
	pub async fn log_in(
		provider: Arc<dyn AuthProvider>,
		credentials: &Credentials,
	) -> Result<Arc<Self>, AuthError> {
		let tokens = provider.login(credentials).await?;
		info!(user_id = %tokens.user_id, "Logged in;");

		Ok(Arc::new(Self {
			tokens: RwLock::new(tokens),
			provider,
		}))
	}

	pub fn id(&self) -> UserId {
		self.tokens.read().user_id.clone()
	}

	pub fn access_token(&self) -> String {
		self.tokens.read().access_token.clone()
	}

	pub(crate) fn session_auth(&self) -> SessionAuth {
		let tokens = self.tokens.read();
		SessionAuth {
			user_id: tokens.user_id.clone(),
			access_token: tokens.access_token.clone(),
		}
	}

	/// Exchanges the refresh token for a new access token and keeps it.
	#[instrument(skip(self), fields(user_id = %self.id()), err)]
	pub async fn refresh_access_token(&self) -> Result<String, AuthError> {
		let (user_id, refresh_token) = {
			let tokens = self.tokens.read();
			(tokens.user_id.clone(), tokens.refresh_token.clone())
		};

		let access_token = self
			.provider
			.refresh_access_token(&user_id, &refresh_token)
			.await?;
		self.tokens.write().access_token.clone_from(&access_token);
		debug!("Refreshed access token;");

		Ok(access_token)
	}
}

use crate::profile::UserId;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// source of the currently authenticated identity
#[async_trait]
pub trait SessionProvider: Send + Sync {
	async fn current_user_id(&self) -> Option<UserId>;
}

#[derive(Default)]
pub struct InMemorySession {
	user_id: RwLock<Option<UserId>>,
}

impl InMemorySession {
	#[must_use]
	pub fn signed_in(user_id: &str) -> Self {
		Self {
			user_id: RwLock::new(Some(user_id.to_string())),
		}
	}

	pub async fn sign_in(&self, user_id: &str) {
		*self.user_id.write().await = Some(user_id.to_string());
	}

	pub async fn sign_out(&self) {
		*self.user_id.write().await = None;
	}
}

#[async_trait]
impl SessionProvider for InMemorySession {
	async fn current_user_id(&self) -> Option<UserId> {
		self.user_id.read().await.clone()
	}
}

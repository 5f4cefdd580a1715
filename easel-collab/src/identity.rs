//! Session identity, passed explicitly into every component.
//!
//! Credential issuance happens elsewhere; this only answers "who is the
//! caller" and lets interested parties watch that answer change.

use easel_core::{CollabError, UserId};
use log::info;
use std::sync::Arc;
use tokio::sync::watch;

/// The signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub user_id: UserId,
    pub display_name: String,
}

impl SessionUser {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Cheap-to-clone identity handle. All clones observe the same login.
#[derive(Clone)]
pub struct Identity {
    current: Arc<watch::Sender<Option<SessionUser>>>,
}

impl Identity {
    pub fn signed_in(user: SessionUser) -> Self {
        Self {
            current: Arc::new(watch::Sender::new(Some(user))),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            current: Arc::new(watch::Sender::new(None)),
        }
    }

    pub fn sign_in(&self, user: SessionUser) {
        info!("Signed in as {} ({})", user.display_name, user.user_id);
        self.current.send_replace(Some(user));
    }

    pub fn sign_out(&self) {
        if let Some(prev) = self.current.send_replace(None) {
            info!("Signed out {}", prev.user_id);
        }
    }

    pub fn current(&self) -> Option<SessionUser> {
        self.current.borrow().clone()
    }

    pub fn current_user_id(&self) -> Option<UserId> {
        self.current.borrow().as_ref().map(|u| u.user_id.clone())
    }

    pub fn current_display_name(&self) -> Option<String> {
        self.current.borrow().as_ref().map(|u| u.display_name.clone())
    }

    /// The caller, or `Unauthenticated` for mutating operations.
    pub fn require(&self) -> Result<SessionUser, CollabError> {
        self.current().ok_or(CollabError::Unauthenticated)
    }

    /// Watch for sign-in/sign-out.
    pub fn subscribe(&self) -> watch::Receiver<Option<SessionUser>> {
        self.current.subscribe()
    }
}

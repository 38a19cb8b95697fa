/// Where front ends should send the user once the session is gone.
pub const UNAUTHENTICATED_ROOT: &str = "/";

/// Session lifecycle notifications, published on a broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn { email: String },
    Refreshed,
    /// Renewal failed and the stored credentials were cleared.
    Expired { redirect_to: String, reason: String },
    LoggedOut,
}

impl SessionEvent {
    pub fn expired(reason: impl Into<String>) -> Self {
        SessionEvent::Expired {
            redirect_to: UNAUTHENTICATED_ROOT.to_string(),
            reason: reason.into(),
        }
    }
}

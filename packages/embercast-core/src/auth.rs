//! Authentication seam.
//!
//! Auth decisions live outside the core; these hooks are the calls the core
//! makes at the points the auth layer cares about. The default [`NoAuth`]
//! admits everyone.

/// External authentication and session-accounting hooks.
pub trait AuthService: Send + Sync {
    /// A source finished init and is streaming.
    fn stream_start(&self, _mount: &str) {}

    /// A source ended (producer gone or shut down).
    fn stream_end(&self, _mount: &str) {}

    /// A listener left a mount; the auth layer closes its session.
    fn release_listener(&self, _mount: &str, _client_id: u64) {}

    /// Whether a listener with `username` may attach given the usernames
    /// already on the mount. Returning false rejects the new listener.
    fn check_duplicate_logins(
        &self,
        _mount: &str,
        _username: Option<&str>,
        _existing: &[String],
    ) -> bool {
        true
    }
}

/// Auth disabled; every client is admitted.
pub struct NoAuth;

impl AuthService for NoAuth {}

//! Client configuration.

/// Default keep-alive interval in seconds.
pub const DEFAULT_KEEP_ALIVE: u16 = 60;

/// Default name of the dispatch thread.
pub const DEFAULT_DISPATCH_THREAD_NAME: &str = "mqtt-dispatch";

/// Default number of failures retained until they are taken.
pub const DEFAULT_FAILURE_CAPACITY: usize = 64;

/// What the dispatch thread does after a handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FailurePolicy {
    /// Record the failure and keep dispatching.
    #[default]
    Continue,
    /// Record the failure and terminate the dispatch thread once it has
    /// handled the events already queued. Later events are dispatched inline
    /// on the engine thread until the loop is started again.
    StopLoop,
}

/// Options for a [`Client`](crate::Client).
///
/// Use [`ClientOptions::builder`] for ergonomic construction.
///
/// ## Sessions
///
/// Without a client id the engine generates one, which only makes sense for a
/// clean session. A client with an explicit id defaults to a persistent
/// session, so that it picks up its subscriptions after reconnecting.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Client identifier, or `None` to let the engine generate one
    pub client_id: Option<String>,
    /// Ask the broker to discard session state on connect
    pub clean_session: bool,
    /// Keep-alive interval in seconds
    pub keep_alive: u16,
    /// Name given to the dispatch thread
    pub dispatch_thread_name: String,
    /// Behaviour of the dispatch thread after a handler failure
    pub failure_policy: FailurePolicy,
    /// Maximum number of unobserved failures kept; the oldest is dropped first
    pub failure_capacity: usize,
}

impl ClientOptions {
    /// Create a new builder for `ClientOptions`
    pub fn builder() -> ClientOptionsBuilder {
        ClientOptionsBuilder::new()
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            clean_session: true,
            keep_alive: DEFAULT_KEEP_ALIVE,
            dispatch_thread_name: DEFAULT_DISPATCH_THREAD_NAME.to_string(),
            failure_policy: FailurePolicy::Continue,
            failure_capacity: DEFAULT_FAILURE_CAPACITY,
        }
    }
}

/// Builder for `ClientOptions`.
///
/// Unset fields fall back to `ClientOptions::default()`, except
/// `clean_session`, which follows the presence of a client id.
#[derive(Debug, Default)]
pub struct ClientOptionsBuilder {
    client_id: Option<String>,
    clean_session: Option<bool>,
    keep_alive: Option<u16>,
    dispatch_thread_name: Option<String>,
    failure_policy: Option<FailurePolicy>,
    failure_capacity: Option<usize>,
}

impl ClientOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = Some(clean_session);
        self
    }

    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = Some(seconds);
        self
    }

    pub fn dispatch_thread_name(mut self, name: impl Into<String>) -> Self {
        self.dispatch_thread_name = Some(name.into());
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    pub fn failure_capacity(mut self, capacity: usize) -> Self {
        self.failure_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> ClientOptions {
        let default = ClientOptions::default();
        let clean_session = self
            .clean_session
            .unwrap_or(self.client_id.is_none());

        ClientOptions {
            client_id: self.client_id,
            clean_session,
            keep_alive: self.keep_alive.unwrap_or(default.keep_alive),
            dispatch_thread_name: self
                .dispatch_thread_name
                .unwrap_or(default.dispatch_thread_name),
            failure_policy: self.failure_policy.unwrap_or(default.failure_policy),
            failure_capacity: self.failure_capacity.unwrap_or(default.failure_capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_client_defaults_to_clean_session() {
        let options = ClientOptions::builder().build();
        assert!(options.client_id.is_none());
        assert!(options.clean_session);
        assert_eq!(options.keep_alive, DEFAULT_KEEP_ALIVE);
        assert_eq!(options.failure_policy, FailurePolicy::Continue);
    }

    #[test]
    fn named_client_defaults_to_persistent_session() {
        let options = ClientOptions::builder()
            .client_id("sensor-1")
            .keep_alive(10)
            .failure_policy(FailurePolicy::StopLoop)
            .build();
        assert_eq!(options.client_id.as_deref(), Some("sensor-1"));
        assert!(!options.clean_session);
        assert_eq!(options.keep_alive, 10);
        assert_eq!(options.failure_policy, FailurePolicy::StopLoop);
    }

    #[test]
    fn explicit_clean_session_wins() {
        let options = ClientOptions::builder()
            .client_id("sensor-1")
            .clean_session(true)
            .build();
        assert!(options.clean_session);
    }
}

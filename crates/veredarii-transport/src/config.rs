use crate::GatePolicy;

/// Configuration for a transport host.
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use veredarii_transport::{GatePolicy, HostConfig};
///
/// let config = HostConfig::new()
///     .recv_buffer(512)
///     .gate(GatePolicy::AllowAll);
/// ```
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Transport address this host listens on.
    pub(crate) listen_address: String,
    /// Channel buffer size for host events.
    pub(crate) recv_buffer: usize,
    /// Channel buffer size per gossip subscription.
    pub(crate) gossip_buffer: usize,
    /// In-flight bytes per stream direction before writers wait.
    pub(crate) stream_window: usize,
    /// Dial and accept policy.
    pub(crate) gate: GatePolicy,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HostConfig {
    pub fn new() -> Self {
        Self {
            listen_address: String::from("/memory/0"),
            recv_buffer: 256,
            gossip_buffer: 64,
            stream_window: 256 * 1024,
            gate: GatePolicy::AllowAll,
        }
    }

    /// Set the advertised listen address.
    pub fn listen_address(mut self, address: impl Into<String>) -> Self {
        self.listen_address = address.into();
        self
    }

    /// Set the event channel buffer size (default: 256).
    pub fn recv_buffer(mut self, capacity: usize) -> Self {
        self.recv_buffer = capacity;
        self
    }

    /// Set the per-subscription gossip buffer (default: 64).
    pub fn gossip_buffer(mut self, capacity: usize) -> Self {
        self.gossip_buffer = capacity;
        self
    }

    /// Set the per-direction stream window (default: 256 KiB).
    pub fn stream_window(mut self, bytes: usize) -> Self {
        self.stream_window = bytes;
        self
    }

    /// Set the connection gate policy (default: allow all).
    pub fn gate(mut self, policy: GatePolicy) -> Self {
        self.gate = policy;
        self
    }
}

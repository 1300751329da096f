//! Client and subscription configuration.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use crate::errors::ClientError;
use crate::protocol::StreamPosition;

/// Asynchronous provider of connection or subscription tokens.
///
/// The callback is invoked before each connect/refresh that needs a token,
/// outside of any engine lock.
pub type TokenCallback =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<String, ClientError>> + Send>> + Send + Sync>;

/// Wire encoding used on top of the WebSocket transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Newline-delimited JSON objects, one per command/reply.
    Json,
    /// Varint length-delimited Protobuf messages. The canonical encoding.
    Protobuf,
}

impl Protocol {
    /// WebSocket subprotocol announced during the handshake.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            Protocol::Json => "centrifuge-json",
            Protocol::Protobuf => "centrifuge-protobuf",
        }
    }
}

/// Client configuration.
///
/// ```rust
/// use std::time::Duration;
/// use centrifuge_client::config::Config;
///
/// let config = Config::new()
///     .with_token("secret")
///     .with_name("my-app")
///     .with_timeout(Duration::from_secs(10));
/// ```
#[derive(Clone)]
pub struct Config {
    /// Authentication token sent in the connect request.
    pub token: String,
    /// Token provider; takes precedence over the static token when set.
    pub token_callback: Option<TokenCallback>,
    /// Client name reported to the server.
    pub name: String,
    /// Client version reported to the server.
    pub version: String,
    /// Wire encoding.
    pub protocol: Protocol,
    /// Extra HTTP headers attached to the WebSocket upgrade request.
    pub headers: Vec<(String, String)>,
    /// Runtime to spawn engine tasks on; defaults to the ambient runtime.
    pub runtime: Option<Handle>,
    /// Deadline applied to every command and to `ready()`.
    pub timeout: Duration,
    /// High-water mark of the outgoing command queue. Once this many
    /// normal-priority commands are pending, further sends fail fast.
    pub max_pending_commands: usize,
    /// Capacity of the publication/message broadcast streams.
    pub stream_buffer: usize,
    /// Delay policy between reconnect attempts.
    pub reconnect_strategy: Arc<dyn ReconnectStrategy>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            token: String::new(),
            token_callback: None,
            name: String::from(env!("CARGO_PKG_NAME")),
            version: String::new(),
            protocol: Protocol::Protobuf,
            headers: Vec::new(),
            runtime: None,
            timeout: Duration::from_secs(5),
            max_pending_commands: 64,
            stream_buffer: 256,
            reconnect_strategy: Arc::new(BackoffReconnect::default()),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_token_callback(mut self, callback: TokenCallback) -> Self {
        self.token_callback = Some(callback);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Adds an HTTP header to the WebSocket upgrade request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_pending_commands(mut self, limit: usize) -> Self {
        self.max_pending_commands = limit;
        self
    }

    pub fn with_reconnect_strategy(mut self, strategy: impl ReconnectStrategy) -> Self {
        self.reconnect_strategy = Arc::new(strategy);
        self
    }

    pub fn use_json(mut self) -> Self {
        self.protocol = Protocol::Json;
        self
    }

    pub fn use_protobuf(mut self) -> Self {
        self.protocol = Protocol::Protobuf;
        self
    }
}

/// Per-subscription configuration.
#[derive(Clone)]
pub struct SubscriptionConfig {
    /// Channel-level authentication token.
    pub token: String,
    /// Channel token provider; takes precedence over the static token.
    pub token_callback: Option<TokenCallback>,
    /// Payload attached to subscribe requests.
    pub data: Vec<u8>,
    /// Known stream position to start recovery from.
    pub since: Option<StreamPosition>,
    /// Ask the server to track a recovery position for this channel.
    pub recoverable: bool,
    /// Ask the server for positioned publications.
    pub positioned: bool,
    /// Receive join/leave presence events.
    pub join_leave: bool,
    /// Bounds for the jittered resubscribe backoff.
    pub min_resubscribe_delay: Duration,
    pub max_resubscribe_delay: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        SubscriptionConfig {
            token: String::new(),
            token_callback: None,
            data: Vec::new(),
            since: None,
            recoverable: false,
            positioned: false,
            join_leave: false,
            min_resubscribe_delay: Duration::from_millis(500),
            max_resubscribe_delay: Duration::from_secs(20),
        }
    }
}

/// Delay policy between reconnection attempts.
pub trait ReconnectStrategy: std::fmt::Debug + Send + Sync + 'static {
    /// Delay before the given attempt (1-based).
    fn time_before_next_attempt(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with jitter.
///
/// The delay before attempt `n` is
/// `min_delay * factor^n * U[0.5, 1.5]`, clamped to
/// `[min_delay, max_delay]`.
#[derive(Debug, Clone)]
pub struct BackoffReconnect {
    pub factor: f64,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectStrategy for BackoffReconnect {
    fn time_before_next_attempt(&self, attempt: u32) -> Duration {
        use rand::Rng;

        if self.min_delay > self.max_delay {
            return self.max_delay;
        }

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let time = self.min_delay.as_secs_f64() * self.factor.powi(attempt as i32) * jitter;
        let time = time.clamp(self.min_delay.as_secs_f64(), self.max_delay.as_secs_f64());
        Duration::from_secs_f64(time)
    }
}

impl Default for BackoffReconnect {
    fn default() -> Self {
        BackoffReconnect {
            factor: 2.0,
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(20),
        }
    }
}

/// Jittered backoff between two bounds, used for resubscribe retries.
pub(crate) fn jittered_delay(attempt: u32, min_delay: Duration, max_delay: Duration) -> Duration {
    BackoffReconnect {
        factor: 2.0,
        min_delay,
        max_delay,
    }
    .time_before_next_attempt(attempt)
}

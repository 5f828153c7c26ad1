/// Application name
pub const APP_NAME: &str = "Courier";

/// Default HTTP / WebSocket port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8000;

/// Capacity of each session's outbound queue
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Capacity of the hub's command channel
pub const HUB_COMMAND_CAPACITY: usize = 1024;

/// Idle interval after which the writer sends a liveness probe
pub const PING_INTERVAL_SECS: u64 = 30;

/// Window in which some inbound traffic must arrive
pub const READ_DEADLINE_SECS: u64 = 60;

/// Upper bound on a single transport write
pub const WRITE_DEADLINE_SECS: u64 = 10;

/// How long the reconciler waits for room in a full outbound queue
pub const BACKLOG_ENQUEUE_TIMEOUT_MS: u64 = 1000;

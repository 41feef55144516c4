/// Maximum number of participants per room.
pub const MAX_ROOM_PARTICIPANTS: usize = 10;

/// Maximum upload size in bytes (25 MiB).
pub const MAX_UPLOAD_SIZE: u64 = 25 * 1024 * 1024;

/// Length of a room code.
pub const ROOM_CODE_LEN: usize = 8;

/// Maximum nickname length in characters.
pub const MAX_NICKNAME_LEN: usize = 40;

/// Capacity of each connection's outbound event queue. A participant whose
/// queue fills up is evicted from its room.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Default HTTP/WebSocket listen port.
pub const DEFAULT_HTTP_PORT: u16 = 3001;

/// URL prefix under which stored uploads are served.
pub const UPLOADS_URL_PREFIX: &str = "/uploads";

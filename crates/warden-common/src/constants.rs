//! System-wide constants and default paths.

use std::time::Duration;

/// Mount point of the kernel process table.
pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Delay before the single retry when the process table cannot be opened.
pub const PROC_TABLE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Maximum number of records the kernel accepts in one `uid_map`/`gid_map` write.
pub const MAX_ID_MAP_ENTRIES: usize = 340;

/// A `uid_map`/`gid_map` write must be shorter than one page.
pub const MAX_ID_MAP_BYTES: usize = 4096;

/// Longest handshake token accepted, newline included.
pub const MAX_HANDSHAKE_TOKEN_LEN: usize = 32;

/// Binary name for the CLI.
pub const BIN_NAME: &str = "warden";

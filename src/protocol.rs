//! Shared protocol constants for the ferry framed transport

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"FRRY";
pub const VERSION: u16 = 1;

// Maximum frame payload size (16MB) - prevents DoS via memory exhaustion.
// Control-channel payloads are JSON envelopes; bulk bytes never ride in frames.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// Side-channel chunk size. Tunable constant, not part of the wire contract:
// the receiver knows each file's exact length from control-channel metadata.
pub const TRANSFER_CHUNK: usize = 64 * 1024;

// Default ports
pub const DEFAULT_PORT: u16 = 9040;
pub const DEFAULT_DISCOVERY_PORT: u16 = 9041;

// Frame type IDs (keep numeric stable across releases)
pub mod frame {
    pub const REQUEST: u8 = 1;
    pub const RESPONSE: u8 = 2;
}

// Recognized request api values
pub mod api {
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const LIST: &str = "list";
    pub const INFO: &str = "info";
    pub const PING: &str = "ping";
    pub const RCD: &str = "rcd";
    pub const RLS: &str = "rls";
    pub const RMKDIR: &str = "rmkdir";
    pub const GET: &str = "get";
    pub const GET_NEXT: &str = "get_next";
    pub const PUT: &str = "put";
    pub const PUT_NEXT: &str = "put_next";
    pub const REXEC: &str = "rexec";
}

/// Stable error codes carried in the response envelope.
///
/// The integer values are part of a deployment's wire contract; never
/// renumber them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NotConnected = 100,
    InvalidCommandSyntax = 101,
    SharingNotFound = 102,
    InvalidPath = 103,
    CommandExecutionFailed = 104,
    InvalidTransaction = 105,
    AuthenticationFailed = 106,
    UnknownApi = 107,
    InvalidRequest = 108,
    SupportedOnlyForUnix = 109,
    RexecDisabled = 110,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::NotConnected => "not connected",
            ErrorCode::InvalidCommandSyntax => "invalid command syntax",
            ErrorCode::SharingNotFound => "sharing not found",
            ErrorCode::InvalidPath => "invalid path",
            ErrorCode::CommandExecutionFailed => "command execution failed",
            ErrorCode::InvalidTransaction => "invalid transaction",
            ErrorCode::AuthenticationFailed => "authentication failed",
            ErrorCode::UnknownApi => "unknown api",
            ErrorCode::InvalidRequest => "invalid request",
            ErrorCode::SupportedOnlyForUnix => "supported only for unix",
            ErrorCode::RexecDisabled => "rexec disabled",
        };
        write!(f, "{} ({})", name, self.as_u32())
    }
}

// Centralized timeout constants for consistent behavior across the stack.
// Frame header reads are deliberately unbounded: a control connection may
// sit idle between user commands for arbitrarily long.
pub mod timeouts {
    // Base timeout for writes (ms)
    pub const WRITE_BASE_MS: u64 = 500;

    // Base timeout for reads (ms)
    pub const READ_BASE_MS: u64 = 300;

    // Additional timeout per MB of data (ms)
    pub const PER_MB_MS: u64 = 1;

    // Window for the peer to connect a transaction's side channel (ms)
    pub const SIDE_ACCEPT_MS: u64 = 30_000;

    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 2_000;

    // Calculate write deadline based on payload size (ms)
    pub fn write_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64 + 1_048_575) / 1_048_576;
        WRITE_BASE_MS + mb * PER_MB_MS
    }

    // Calculate read deadline based on payload size (ms)
    pub fn read_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64 + 1_048_575) / 1_048_576;
        READ_BASE_MS + mb * PER_MB_MS
    }
}

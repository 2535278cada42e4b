pub mod relay;

// Re-export commonly used types for convenience
pub use relay::{
    BufferPolicy, CloseReason, ConnectionState, RelayError, RelayResult, RestartPolicy,
    SessionOptions, VoiceRelay,
};

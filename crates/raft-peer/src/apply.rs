//! # apply
//!
//! why: define the record a peer emits when a committed command reaches the host
//! relations: produced by peer.rs's apply pump, consumed from the host's channel
//! what: ApplyMsg struct

/// one committed command delivered to the host, in strict index order
///
/// `command_valid` is always true in this revision; it exists so future
/// control records (snapshots, membership) can share the channel
#[derive(Debug, Clone)]
pub struct ApplyMsg {
    /// true when this record carries a newly committed command
    pub command_valid: bool,
    /// the opaque command payload, exactly as submitted to `start`
    pub command: Vec<u8>,
    /// 1-based log index of the command; increases by exactly 1 per record
    pub command_index: u64,
}

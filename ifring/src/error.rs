use crate::buf::Packet;

/// Failure to map packet memory for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("too many DMA segments")]
    TooManySegments,
    #[error("out of mapping resources")]
    NoMemory,
    #[error("mapping failed")]
    Failed,
}

/// Failure reported by a device's descriptor encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EncapError {
    #[error("out of descriptors")]
    NoDescriptors,
    #[error("too many segments for the device")]
    TooManySegments,
    #[error("packet cannot be encoded")]
    Invalid,
}

/// Why a free-list refill stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RefillError {
    #[error("buffer pool exhausted")]
    OutOfMemory,
    #[error("buffer mapping failed")]
    MappingFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("no completed packet at the queue head")]
    NoPacket,
    #[error("device error: {0}")]
    Failed(String),
}

/// Malformed or unsupported L2-L4 headers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("truncated {0} header")]
    Truncated(&'static str),
    #[error("unsupported ethertype {0:#06x}")]
    EtherType(u16),
    #[error("segmentation offload requested for a non-TCP packet")]
    NotTcp,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid device parameters: {0}")]
    InvalidParams(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("no tokio runtime available for deferred work")]
    NoRuntime,
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Rejected submission. The packets are handed back untouched.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("submission ring full")]
    Full(Vec<Packet>),
    #[error("interface is not running")]
    NotRunning(Vec<Packet>),
    #[error("queue is closed")]
    Closed(Vec<Packet>),
}

impl SubmitError {
    pub fn into_packets(self) -> Vec<Packet> {
        match self {
            SubmitError::Full(p) | SubmitError::NotRunning(p) | SubmitError::Closed(p) => p,
        }
    }
}

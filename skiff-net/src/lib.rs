//! Guest network plumbing for skiff micro-VMs.
//!
//! Two independent subsystems used by the runtime layer:
//! - address bookkeeping on the host: [`IndexedAllocator`] and
//!   [`RotatingAllocator`] hand out IPv4 addresses, host ports, and
//!   vsock ports;
//! - an rtnetlink client for the guest: [`netlink::NetlinkSession`]
//!   configures interfaces, addresses, and routes over a raw
//!   `NETLINK_ROUTE` socket with hand-rolled framing.

mod allocator;
mod cidr;
pub mod netlink;

pub use allocator::{Address, IndexedAllocator, RotatingAllocator};
pub use cidr::Ipv4Cidr;

/// Result type for skiff-net operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from allocation and netlink operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A malformed CIDR, range, or interface name.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The allocator has been disabled.
    #[error("allocator disabled")]
    AllocatorDisabled,

    /// Every slot of the allocator is taken.
    #[error("allocator full")]
    AllocatorFull,

    /// The chosen index does not map to a representable address.
    #[error("index {0} not representable")]
    InvalidIndex(u32),

    /// The address lies outside the allocator's range.
    #[error("address {0} out of range")]
    InvalidAddress(u64),

    /// The address is already held by another caller.
    #[error("address {0} already allocated")]
    AlreadyAllocated(u64),

    /// The address is not currently allocated.
    #[error("address {0} not allocated")]
    NotAllocated(u64),

    /// A request could not be serialized.
    #[error("netlink marshal failure: {0}")]
    SendMarshal(String),

    /// A response could not be parsed.
    #[error("netlink unmarshal failure: {0}")]
    RecvUnmarshal(String),

    /// The kernel answered with a negative status.
    #[error("netlink response error {0}")]
    ResponseError(i32),

    /// A response payload was too short for its advertised structure.
    #[error("unexpected payload layout")]
    UnexpectedInfo,

    /// An attribute ran past the end of its message.
    #[error("unexpected attribute offset")]
    UnexpectedOffset,

    /// A query matched an unexpected number of results.
    #[error("unexpected result set: {0}")]
    UnexpectedResultSet(String),

    /// A blocking call was interrupted by a signal.
    #[error("interrupted")]
    Interrupted,

    /// Socket-level I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

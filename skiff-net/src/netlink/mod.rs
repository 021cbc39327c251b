//! rtnetlink client: framing, socket, and the operation surface.

mod frame;
mod session;
mod socket;

pub use frame::{
    AddressInfo, InterfaceInfo, NetlinkMessageHeader, RouteInfo, RtAttribute, align4,
};
pub use session::{Link, NetlinkSession};
#[cfg(target_os = "linux")]
pub use socket::RouteSocket;
pub use socket::NetlinkSocket;

pub use frame::{
    AF_INET, DEFAULT_CHANGE, IFA_ADDRESS, IFA_LOCAL, IFF_UP, IFLA_IFNAME, NLM_F_ACK,
    NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_MULTI, NLM_F_REQUEST, NLMSG_DONE, NLMSG_ERROR,
    NLMSG_NOOP, NLMSG_OVERRUN, RT_SCOPE_LINK, RT_SCOPE_UNIVERSE, RT_TABLE_MAIN, RTA_DST,
    RTA_GATEWAY, RTA_OIF, RTA_PREFSRC, RTM_GETLINK, RTM_NEWADDR, RTM_NEWLINK, RTM_NEWROUTE,
    RTN_UNICAST, RTPROT_BOOT, RTPROT_KERNEL,
};

//! Pre-routing interception engine for the natcap tunnel protocol.
//!
//! The engine inspects the first packet(s) of every tracked flow, detects
//! natcap-encoded traffic (TCP SYN with an embedded tunnel option, or one of
//! two UDP sub-protocols multiplexed by fixed magic markers), selects a relay
//! server and retargets the connection toward it exactly once. Subsequent
//! packets of a classified flow take a constant-time fast path.

pub mod codec;
pub mod config;
pub mod conntrack;
pub mod engine;
pub mod logger;
pub mod packet;
pub mod redirect;
pub mod server;

pub use config::{ForwardConfig, ConfigError};
pub use conntrack::{ConnDir, ConnRecord, ConnState, Conntrack, FlowTuple};
pub use engine::{ForwardEngine, Verdict, MARK_NATCAP};
pub use packet::ip::IpPkt;
pub use redirect::{DnatTable, RedirectError, Redirector};
pub use server::{ServerPool, ServerSelect};

//! Group communication for a set of cooperating processes: members discover each other through
//!  periodic membership beacons, and exchange messages point-to-point over TCP (or UDP) with
//!  optional acknowledgement. Messages pass through a configurable stack of interceptors.

pub mod channel;
pub mod interceptor;
pub mod membership;
pub mod messaging;
pub mod transport;
pub mod util;
pub mod test_util;

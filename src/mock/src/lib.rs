pub mod bgp;
pub mod iptables;
pub mod speaker;

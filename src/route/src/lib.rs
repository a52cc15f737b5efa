pub mod error;
pub mod iptables;
pub mod speaker;

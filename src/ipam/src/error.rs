use std::net::IpAddr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("IDs exhausted")]
    IdsExhausted,

    #[error("ID out of range: {0}")]
    OutOfRange(u32),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Protocol mismatch")]
    ProtocolMismatch,

    #[error("Not contains")]
    NotContains,

    #[error("Pool too large: {0} addresses")]
    PoolTooLarge(u128),

    #[error("Pool {0} overlaps with pool {1}")]
    Overlap(String, String),

    #[error("No pool contains {0}")]
    NoPoolForAddress(IpAddr),

    #[error("Port {port} on {addr} is already used by {owner}")]
    PortInUse {
        addr: IpAddr,
        port: u16,
        owner: String,
    },
}

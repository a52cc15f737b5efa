use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("std::io::Error: {0}")]
    StdIo(#[from] std::io::Error),

    #[error("failed to communicate with gRPC server: {0}")]
    FailedToCommunicateWithgRPC(#[from] tonic::transport::Error),

    #[error("timeout")]
    Timeout,

    #[error("got error {0} from gRPC")]
    GotgRPC(#[from] tonic::Status),

    #[error("invalid next hop from speaker: {0}")]
    InvalidNexthop(String),

    #[error("iptables failed on `{rule}`: {reason}")]
    Iptables { rule: String, reason: String },
}

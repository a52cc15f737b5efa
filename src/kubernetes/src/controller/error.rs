use elbd_trace::error::TraceableError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("std::io::Error")]
    StdIo(#[from] std::io::Error),

    #[error("failed to get lock")]
    FailedToGetLock,

    #[error("config error")]
    Config(#[from] ConfigError),

    #[error("SerializationError: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    Kube(#[source] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("Ipam Error: {0}")]
    Ipam(#[source] elbd_ipam::error::Error),

    #[error("Route Error: {0}")]
    Route(#[source] elbd_route::error::Error),

    #[error("Metrics Error: {0}")]
    Metrics(#[source] prometheus::Error),

    #[error("Trace Error: {0}")]
    Trace(#[source] elbd_trace::error::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("no available address for {0}")]
    NoAvailableAddress(String),

    #[error("unknown ip selection strategy: {0}")]
    UnknownStrategy(String),

    #[error("MY_NODE_NAME is not set")]
    MissingNodeName,

    #[error("Node {0} has no address")]
    NodeAddressNotFound(String),
}

impl Error {
    fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube(kube::Error::Api(ae)) => Some(ae.code),
            Error::Finalizer(e) => match e.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(e)
                | kube::runtime::finalizer::Error::CleanupFailed(e) => e.api_code(),
                kube::runtime::finalizer::Error::AddFinalizer(kube::Error::Api(ae))
                | kube::runtime::finalizer::Error::RemoveFinalizer(kube::Error::Api(ae)) => {
                    Some(ae.code)
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// The object went away while it was reconciled.
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// An optimistic-lock write lost against a newer version of the object.
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// The object itself asks for something that cannot be satisfied until it
    /// or the pools change.
    pub fn is_validation(&self) -> bool {
        match self {
            Error::InvalidAddress(_) | Error::NoAvailableAddress(_) => true,
            Error::Ipam(e) => !matches!(
                e,
                elbd_ipam::error::Error::IdsExhausted | elbd_ipam::error::Error::OutOfRange(_)
            ),
            Error::Finalizer(e) => match e.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(e)
                | kube::runtime::finalizer::Error::CleanupFailed(e) => e.is_validation(),
                _ => false,
            },
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load")]
    FailedToLoad,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl TraceableError for &Error {
    fn metric_label(&self) -> String {
        (*self).metric_label()
    }
}

impl TraceableError for Error {
    fn metric_label(&self) -> String {
        match self {
            Error::StdIo(_) => "stdio",
            Error::FailedToGetLock => "failedtogetlock",
            Error::Config(_) => "config",
            Error::Serialization(_) => "serialization",
            Error::Kube(_) => "kube",
            Error::Finalizer(e) => match e.as_ref() {
                kube::runtime::finalizer::Error::ApplyFailed(e)
                | kube::runtime::finalizer::Error::CleanupFailed(e) => return e.metric_label(),
                _ => "finalizer",
            },
            Error::Ipam(_) => "ipam",
            Error::Route(_) => "route",
            Error::Metrics(_) => "metrics",
            Error::Trace(_) => "trace",
            Error::InvalidAddress(_) => "invalidaddress",
            Error::NoAvailableAddress(_) => "noavailableaddress",
            Error::UnknownStrategy(_) => "unknownstrategy",
            Error::MissingNodeName => "missingnodename",
            Error::NodeAddressNotFound(_) => "nodeaddressnotfound",
        }
        .to_string()
    }
}

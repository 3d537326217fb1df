use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Core(#[from] iox_core::Error),
    #[error("{0}")]
    Descriptor(#[from] iox_core::DescriptorError),
    #[error("{0}")]
    Network(#[from] iox_core::NetworkError),
    #[error("{0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("fwd requires exactly two descriptors")]
    FwdArity,
    #[error("proxy requires one or two descriptors")]
    ProxyArity,
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;

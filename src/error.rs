use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("Memory not mapped at address: {0:#x}")]
    UnmappedMemory(u64),

    #[error("Permission denied for operation at address: {0:#x}")]
    PermissionDenied(u64),

    #[error("Copy-in of {len} bytes from user address {addr:#x} failed")]
    CopyinFailed { addr: u64, len: usize },

    #[error("Copy-out of {len} bytes to user address {addr:#x} failed")]
    CopyoutFailed { addr: u64, len: usize },

    #[error("Instruction fetch failed at address: {0:#x}")]
    FetchFailed(u64),
}

pub type Result<T> = std::result::Result<T, EmulatorError>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Null hook target")]
    NullTarget,

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Unrecognized prologue at {0:#x}")]
    UnsupportedPrologue(usize),

    #[error("Memory protection failed: {0}")]
    MemoryProtection(String),

    #[error("Trampoline allocation failed: {0}")]
    TrampolineAlloc(String),

    #[error("Bad rule token: {0:?}")]
    BadRule(String),

    #[error("Hook installation failed: {0}")]
    HookFailed(String),
}

pub type Result<T> = std::result::Result<T, FilterError>;

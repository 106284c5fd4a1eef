//! Error types for the XFlat storage core

use thiserror::Error;

pub type Result<T> = std::result::Result<T, XFlatError>;

#[derive(Error, Debug)]
pub enum XFlatError {
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("write conflict: {0}")]
    WriteConflict(String),

    #[error("transaction state: {0}")]
    TransactionState(String),

    #[error("illegal transaction state: {0}")]
    IllegalTransactionState(String),

    #[error("engine state: {0}")]
    EngineState(String),

    #[error("conversion error: {0}")]
    Conversion(String),

    #[error("shard routing error: {0}")]
    Sharding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("dump failed: {0}")]
    Dump(String),

    #[error("recovery error: {0}")]
    Recovery(String),
}

impl XFlatError {
    /// True for errors raised by an engine that is not (or no longer)
    /// accepting operations. The sharded router retries these once against
    /// a freshly resolved child engine.
    pub fn is_engine_state(&self) -> bool {
        matches!(self, XFlatError::EngineState(_))
    }
}

impl From<xmltree::ParseError> for XFlatError {
    fn from(err: xmltree::ParseError) -> Self {
        XFlatError::Xml(err.to_string())
    }
}

impl From<xmltree::Error> for XFlatError {
    fn from(err: xmltree::Error) -> Self {
        XFlatError::Xml(err.to_string())
    }
}

impl From<serde_json::Error> for XFlatError {
    fn from(err: serde_json::Error) -> Self {
        XFlatError::Conversion(err.to_string())
    }
}

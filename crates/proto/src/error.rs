use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("message body truncated: expected at least {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("body length {0} exceeds the maximum of {}", crate::MAX_BODY)]
    TooLarge(u32),
    #[error("unrecognized message code {0}")]
    UnknownCode(u32),
    #[error("message body is not valid UTF-8")]
    BadString,
    #[error("message body is missing its nul terminator")]
    UnterminatedString,
}

pub type Result<T> = std::result::Result<T, Error>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("empty request line")]
    EmptyCommand,

    #[error("command line is not valid UTF-8")]
    InvalidEncoding,

    #[error("invalid arguments")]
    InvalidArgs,

    #[error("invalid payload framing")]
    InvalidPayload,
}

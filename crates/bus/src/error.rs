use thiserror::Error;

/// Errors produced by the command and query buses.
#[derive(Debug, Error)]
pub enum BusError {
    /// No handler was registered for the dispatched command.
    #[error("No handler registered for command '{command}'")]
    NoHandlerRegistered { command: &'static str },

    /// A second handler was registered for the same command type.
    #[error("Multiple handlers registered for command '{command}'")]
    MultipleHandlersRegistered { command: &'static str },

    /// The handler itself failed.
    #[error("Handler for '{command}' failed: {source}")]
    Handler {
        command: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Result<T> = std::result::Result<T, BusError>;

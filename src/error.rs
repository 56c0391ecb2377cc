use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to create trigger pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("failed to install handler for signal {signal}: {source}")]
    SignalInstall {
        signal: i32,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn reporter thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to register exit hook")]
    ExitHook,

    #[error("failed to find symbol {symbol}: {reason}")]
    MissingSymbol { symbol: String, reason: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

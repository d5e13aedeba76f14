use thiserror::Error;

#[derive(Error, Debug)]
pub enum AcornError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("No endpoint at height >= {0}")]
    NoEndpoint(u32),

    #[error("Configuration error: {0}")]
    Config(String),
}

//! Core error abstractions.

use thiserror::Error;

/// Data model error variants.
#[derive(Debug, Error)]
pub enum Error {
    /// The named game-server container does not exist in the pod template.
    #[error("could not find a container named {0}")]
    ContainerNotFound(String),
    /// A GameServer snapshot could not be serialized.
    #[error("error serializing GameServer snapshot")]
    Serialization(#[from] serde_json::Error),
}

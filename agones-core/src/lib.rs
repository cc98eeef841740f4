pub mod crd;
pub mod error;

pub use error::Error;

/// The version of this build, recorded on every Pod the controller creates.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Label selector matching all Pods backing a GameServer.
pub const GAME_SERVER_POD_SELECTOR: &str = "stable.agones.dev/role=gameserver";

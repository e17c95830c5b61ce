//! Process-backed console sessions for Qube containers.
//!
//! A [`SessionRegistry`] owns at most one eval process per container. The
//! [`CommandCorrelator`] turns those raw line streams into request/response
//! calls; the [`StreamingBridge`] relays them live with per-command tags.

pub mod correlator;
pub mod error;
pub mod launcher;
pub mod local_bridge;
pub mod registry;
pub mod session;
pub mod stream;

pub use correlator::{
    CapturedOutput, Command, CommandCorrelator, CompletionMode, CorrelatorConfig,
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_QUIESCENCE,
};
pub use error::SessionError;
pub use launcher::{LaunchSpec, Launcher, ProcessHandle};
pub use local_bridge::{container_from_location, LocalBridge};
pub use registry::{RegistryConfig, SessionRegistry};
pub use session::{OutputChunk, Session, SessionInfo, DEFAULT_OUTPUT_BUFFER_BYTES};
pub use stream::{BridgeEvent, BridgeSubscriber, OutputTagger, Settlement, StreamingBridge};

pub mod activation;
pub mod console_wire;
pub mod echo;
pub mod engine;

pub use activation::{
    activation_urls, parse_activation_url, ActivationError, ActivationEvent, ActivationForward,
    ActivationQueue,
};
pub use console_wire::{
    ClientFrame, FrameError, OutputStream, ServerFrame, StreamProtocol, DEFAULT_MAX_FRAME_BYTES,
};
pub use echo::EchoFilter;
pub use engine::{ContainerEntry, ContainerList, EngineClient, EngineError};

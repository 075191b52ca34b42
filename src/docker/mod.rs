// Container runtime ports: the Image/Container Service traits, the docker CLI
// adapter, and in-memory doubles.

pub mod engine;
pub mod fake;
mod run;
pub mod service;
pub mod types;

pub use engine::DockerCli;
pub use service::{ContainerService, ImageService, RuntimeError};
pub use types::{
    CancelToken, ContainerHandle, HostConfig, ImageConfig, ImageMetadata, OutputLine, OutputSink,
};

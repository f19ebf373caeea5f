pub mod docker;
pub mod github;
pub mod public_ip;

pub use docker::{ContainerEngine, DockerClient};
pub use github::GitHubApp;

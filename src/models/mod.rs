mod deployment;
mod domain;
mod github;
mod project;
mod service;

pub use deployment::*;
pub use domain::*;
pub use github::*;
pub use project::*;
pub use service::*;

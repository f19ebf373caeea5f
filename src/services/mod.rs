pub mod caddy;
pub mod deployer;
pub mod domains;

pub use caddy::CaddyConfigurator;
pub use deployer::Deployer;
pub use domains::DomainService;

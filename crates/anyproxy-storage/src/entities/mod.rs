pub mod global_config;
pub mod routes;
pub mod usage_logs;

pub use global_config::Entity as GlobalConfig;
pub use routes::Entity as Routes;
pub use usage_logs::Entity as UsageLogs;

pub mod actuation;
pub mod api;
pub mod config;
pub mod daemon;
pub mod device;
pub mod events;
pub mod input;
pub mod mqtt;
pub mod scheduler;
pub mod sensors;
pub mod settings;
pub mod watchdog;

pub use config::Config;
pub use config::LogLevel;
pub use daemon::Context;
pub use events::BusEvent;
pub use events::EventBus;
pub use settings::SettingsStore;

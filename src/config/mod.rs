/// Database configuration and connection management
pub mod database;

/// Engine settings and tuition group seeds loaded from config.toml
pub mod settings;

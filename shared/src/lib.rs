pub mod config;
pub mod topic;
pub mod types;
pub mod utils;

pub use config::load_config;
pub use topic::TopicScheme;
pub use types::{
    AppConfig, AuthError, Claims, JwtConfig, MqttConfig, Principal, ServerConfig,
};
pub use utils::{generate_jwt, now_utc, verify_jwt};

pub mod channel;
pub mod channel_config;
pub mod coordinator;
pub mod error;
pub mod listener;
pub mod send_options;
pub mod services;

pub mod channel_interceptor;
pub mod encrypt;
pub mod fragmentation;
pub mod message_dispatch;
pub mod order;
pub mod throughput;

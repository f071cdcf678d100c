pub mod bind;
pub mod receiver;
pub mod receiver_config;
pub mod sender;
pub mod sender_config;
pub mod task_pool;
pub mod worker_pool;

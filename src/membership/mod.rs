pub mod member;
pub mod member_table;
pub mod membership_config;
pub mod membership_service;

pub mod config;
pub mod error;
pub mod member;
pub mod presence;
pub mod voice;

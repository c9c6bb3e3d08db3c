pub mod codec;
pub mod loopback;
pub mod reporter;
pub mod rtc;
pub mod store;
pub mod token;

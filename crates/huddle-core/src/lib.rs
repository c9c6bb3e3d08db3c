//! huddle-core: presence and voice-state synchronization for small group
//! voice rooms.
//!
//! # Architecture
//!
//! - **domain**: members, presence deltas, voice-activity records, config
//!   and errors (no I/O).
//! - **application**: member registry, update queue, coalescing presence
//!   writes, voice activity, broadcast fan-out, audio recovery, and the
//!   [`RoomSession`](application::session::RoomSession) that ties them
//!   together behind port traits.
//! - **adapters**: in-process loopback transports, a simulated RTC
//!   transport, JSON codec and stores, token and error-reporting sinks.

pub mod adapters;
pub mod application;
pub mod domain;

//! 链路状态层 - 键类型与权威状态存储

pub mod key;
pub mod store;

pub use key::{normalize_link_name, LinkKey, Role};
pub use store::{Applied, EffectiveState, LinkRecord, LinkStateStore, ObservedState};

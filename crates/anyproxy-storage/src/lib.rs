pub mod entities;
pub mod storage;

pub use storage::{RouteInput, RouteStorage, UsageRecord};

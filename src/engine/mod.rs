pub mod dispatch;
pub mod lifecycle;
pub mod notify;
pub mod queue;
pub mod reachability;

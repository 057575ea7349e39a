pub mod publisher;
pub mod subscriber;
pub mod topic;

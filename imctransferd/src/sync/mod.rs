pub mod backoff;
pub mod box_remote;
pub mod executor;
pub mod hash;
pub mod orchestrator;
pub mod paths;
pub mod planner;
pub mod remote;
pub mod report;
pub mod store;

mod locker;
mod reclaimer;
mod worker;

pub mod collaborator;
pub mod jobqueue;
pub mod jobrunner;
pub mod registry;

pub use jobqueue::JobQueue;
pub use worker::Worker;

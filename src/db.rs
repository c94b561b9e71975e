pub mod job;
pub mod queue;

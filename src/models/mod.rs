pub mod job;
pub mod queue;
pub mod reference;
pub mod requests;

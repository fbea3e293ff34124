//! Scene render queue
//!
//! Schedules scene renders for a single-GPU video renderer across named
//! queues, resolves references between scenes at dispatch, lays speech and
//! background audio over finished renders, and concatenates a queue's scenes
//! into one episode file.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;

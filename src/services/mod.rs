pub mod finalizer;
pub mod import;
pub mod media;
pub mod mixer;
pub mod registry;
pub mod renderer;
pub mod resolver;
pub mod scheduler;

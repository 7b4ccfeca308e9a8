pub mod resource;

pub use loadstone_tasks as tasks;

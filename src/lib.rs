pub mod batch_state;
pub mod config;
pub mod db;
pub mod generator;
pub mod jobs;
pub mod model;
pub mod pipeline;
pub mod publisher;
pub mod queue;
pub mod render;
pub mod scheduler;
pub mod selector;
pub mod storage;
pub mod worker;

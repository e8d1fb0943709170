pub mod config;
pub mod frame;
pub mod plan;
pub mod roi;

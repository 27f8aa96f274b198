pub mod config;
pub mod converge;
pub mod plan;
pub mod reset;
pub mod status;

pub mod api;
pub mod capability;
pub mod config;
pub mod deploy;
pub mod doctor;
pub mod errors;
pub mod exec;
pub mod hosting;
pub mod jsx;
pub mod logging;
pub mod provision;
pub mod render;
pub mod util;

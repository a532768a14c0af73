pub mod app;
pub mod config;
pub mod container;
pub mod daemon;
pub mod errors;
pub mod git;
pub mod logging;
pub mod review;
pub mod runner;
pub mod signals;
pub mod sync;
pub mod watch;

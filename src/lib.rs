pub mod budget;
pub mod errors;
pub mod execution;
pub mod init;
pub mod lock;
pub mod logging;
pub mod mason_config;
pub mod priority;
pub mod providers;
pub mod review;
pub mod store;
pub mod util;

pub use errors::{MasonError, MasonResult};

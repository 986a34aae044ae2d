pub mod accounts;
pub mod api;
pub mod arguments;
pub mod http_client;
mod run;

pub use self::run::{run, start};

pub mod conf;
pub mod provision;
pub mod schema;
pub mod utils;
pub mod verify;

pub mod db;
pub mod enums;
pub mod o11y;
pub mod testing;

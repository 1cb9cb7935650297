mod mysql;

#[cfg(test)]
pub mod memory;

pub use mysql::{mask_dsn, MySqlUserRepository};

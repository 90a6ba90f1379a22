pub mod aes;
pub mod error;
pub mod layout;
pub mod outlog;
pub mod state;
pub mod stats;

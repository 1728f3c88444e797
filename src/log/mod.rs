pub mod stream;

pub use stream::{LOG_FILE_NAME, LogStream};

pub mod appender;
pub mod registry;

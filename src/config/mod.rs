/// Feed, window and replay configuration

pub mod settings;

pub use settings::*;

pub mod category;
pub mod cli;
pub mod fetcher;
pub mod load_config;
pub mod mailbox;
pub mod metadata;
pub mod minify;
pub mod packager;
pub mod selection;
pub mod site;

pub use cli::{run, Cli, Commands};

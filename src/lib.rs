pub mod api;
pub mod config;
pub mod http;
pub mod icy;
pub mod listener;
pub mod mpeg;
pub mod puller;
pub mod request;
pub mod response;
pub mod ring;
pub mod server;
pub mod source;
pub mod utils;

use arg::Args;

#[derive(Debug, Args)]
pub struct ArgParse {
    #[arg(short = "c", long = "config")]
    /// Configuration file path
    pub config_file: Option<String>,
}

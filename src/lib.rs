pub mod chroma_store;
pub mod colpali;
pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod loader;
pub mod models;
pub mod retrieval;
pub mod scoring;
pub mod search;
pub mod server;
pub mod tts;
pub mod voice;
pub mod whisper;

pub use config::AppConfig;
pub use server::run_server;

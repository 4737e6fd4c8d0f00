pub mod bookstack;
pub mod config;
pub mod dokuwiki;
pub mod error;
pub mod http;
pub mod media;
pub mod migrator;
pub mod page_path;
pub mod progress;
pub mod rewrite;
pub mod sequencer;
pub mod wikijs;

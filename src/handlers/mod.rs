pub mod audio;
pub mod config;
pub mod form;
pub mod models;
pub mod separation;
pub mod subtitles;

pub use audio::*;
pub use config::*;
pub use models::*;
pub use separation::*;
pub use subtitles::*;

pub mod app;
pub mod logging;
pub mod playlist;
pub mod settings;

pub mod events;
pub mod history;
pub mod keys;
pub mod mask;
pub mod models;
pub mod modes;
pub mod overlays;
pub mod store;

pub mod chat;
pub mod events;
pub mod media;
pub mod sessions;

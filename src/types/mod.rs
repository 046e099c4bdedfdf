//! Core value types shared by the recorder, replay engine and history store.

mod message;

pub use message::{Content, Part, Role};

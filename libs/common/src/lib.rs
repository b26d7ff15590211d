pub mod code;
pub mod id;
pub mod protocol;

pub use code::{generate_join_code, generate_room_id};

pub mod gesture;
pub mod keys;

pub use gesture::{Gesture, GestureError};
pub use keys::{parse_key, ParsedKey};

pub mod cursor;
pub mod event;
pub mod normalize;

pub use cursor::Cursor;
pub use event::{EventRow, MediaType, WatchEvent};
pub use normalize::{normalize_history_record, ValidationError};

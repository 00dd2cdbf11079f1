pub mod error;
pub mod traits;
pub mod trakt;

pub use error::SourceError;
pub use traits::{HistoryPage, HistorySource, SyncWindow};
pub use trakt::client::{TraktClient, TraktClientOptions};

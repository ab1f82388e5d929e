pub mod chain;
pub mod log;
pub mod manager;
pub mod models;
pub mod store;
pub mod subfeed;

pub use manager::{FeedInfo, FeedManager, ManagerStatus, SubfeedWatch};
pub use subfeed::{SharedSubfeed, Subfeed, SubfeedHandle};

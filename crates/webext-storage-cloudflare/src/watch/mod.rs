mod polling;

pub use polling::PollingChangeFeed;

mod notify_watcher;

pub use notify_watcher::NotifyChangeFeed;

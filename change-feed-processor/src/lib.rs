pub mod bootstrapper;
pub mod builder;
pub mod config;
pub mod continuation;
pub mod controller;
pub mod error;
pub mod estimator;
pub mod feed;
pub mod health;
pub mod lease;
pub mod load_balancer;
pub mod metrics_consts;
pub mod observer;
pub mod partition_manager;
pub mod store;
pub mod strategy;
pub mod supervisor;
pub mod synchronizer;

// Re-export main types for library users
pub use builder::{ChangeFeedProcessor, ChangeFeedProcessorBuilder};
pub use config::Config;
pub use error::{Error, Result};
pub use estimator::{EstimatedWork, RemainingWorkEstimator};
pub use feed::{ChangeFeedSource, FeedPosition, Page, PartitionRange};
pub use lease::Lease;
pub use observer::{ChangeFeedContext, ChangeFeedObserver, ChangeFeedObserverFactory};

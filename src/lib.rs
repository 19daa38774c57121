pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod maintenance;
pub mod metrics;
pub mod normalize;
pub mod notify;
pub mod poller;
pub mod policy;
pub mod probe;
pub mod setup;
pub mod snapshot;
pub mod state;
pub mod users;

pub use app::AppContext;
pub use error::CoreError;
pub use state::SharedState;

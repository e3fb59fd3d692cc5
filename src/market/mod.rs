pub mod alerts;
pub mod endpoint;
pub mod pipeline;
pub mod quotes;
pub mod session;
pub mod types;

pub mod alerts;
pub mod health;
pub mod quote_stream;

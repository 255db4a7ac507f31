pub mod event;
pub mod experiment;
pub mod health;
pub mod lock;
pub mod metrics;
pub mod redis;
pub mod retry;
pub mod time;

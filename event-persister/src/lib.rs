pub mod config;
pub mod error;
pub mod evaluations;
pub mod experiments;
pub mod extractor;
pub mod kafka;
pub mod linker;
pub mod metrics_consts;
pub mod persister;
pub mod pump;
pub mod retry;
pub mod singleflight;
pub mod source;
pub mod test_utils;
pub mod windower;
pub mod writer;

//! Operational HTTP surface of the credit sync service: health, pool metrics,
//! consumer warm-start/removal and the synchronous credit path.

pub mod app;

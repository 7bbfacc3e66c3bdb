#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod catalog;
pub mod naming;
pub mod observed;
pub mod priority;
pub mod profile;
pub mod summary;
pub mod types;

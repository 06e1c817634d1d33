#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Protocol-independent core for `evalbot` (post model, command parsing,
//! result rendering, credential storage).

pub mod command;
pub mod credentials;
pub mod post;
pub mod value;

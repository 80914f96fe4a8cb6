//! GripDL daemon and native-messaging host.

pub mod app;
pub mod capture;
pub mod config;
pub mod native_host;

pub mod configuration;
pub use configuration::Config;

pub mod controller;
pub use controller::Controller;

pub mod data_capture;

pub mod error_handling;

pub mod network;

pub mod projection;

pub mod session_management;

pub mod storage;

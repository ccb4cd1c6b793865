pub mod actuators;
pub mod api;
pub mod webhook;

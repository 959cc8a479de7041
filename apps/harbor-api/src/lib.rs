//! Harbor front door: starts build workers for deploy requests and streams
//! their logs to browsers over WebSocket.

pub mod app;
pub mod config;
pub mod deploy;
pub mod orchestrator;
pub mod realtime;
pub mod slug;
pub mod telemetry;

//! Multi-camera tiled motion-detection pipeline core. The binary in
//! `main.rs` wires this library's components against real config, a real
//! GStreamer decoder, and a real detector implementation; tests wire the
//! same components against fakes.

pub mod capture;
pub mod config;
pub mod controller;
pub mod decode;
pub mod detector;
pub mod error;
pub mod frame;
pub mod fsutil;
pub mod history;
pub mod monitor;
pub mod source;
pub mod writer;

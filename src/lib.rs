//! Bridges a game's motion events to connected devices.
//!
//! Game frames arrive over a websocket, are decoded into [`event::GameEvent`]s,
//! shaped by the [`motion`] engine using the live [`tuning`] parameters, and
//! dispatched by the [`device`] session to a Buttplug-compatible device server.
//! Both websocket links are kept alive by the [`link`] supervisor.

pub mod bridge;
pub mod config;
pub mod device;
pub mod event;
pub mod link;
pub mod motion;
pub mod persistence;
pub mod pipeline;
pub mod status;
pub mod tuning;

pub use bridge::BridgeHandle;
pub use config::AppConfig;

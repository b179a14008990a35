//! Constants used throughout the library
//!
//! This module centralizes event names, default timings and other constant
//! values shared by the loader, the event bus and the render scheduler.

use std::time::Duration;

// Event names emitted by models and views
pub const EVENT_LOAD: &str = "load";
pub const EVENT_SETUP_FINISHED: &str = "setupFinished";
pub const EVENT_DRAW_FINISHED: &str = "drawFinished";
pub const EVENT_PAUSE_RENDER: &str = "pauseRender";
pub const EVENT_RESUME_RENDER: &str = "resumeRender";

/// Separator between an event name and its namespace (`"click.tooltip"`)
pub const NAMESPACE_SEPARATOR: char = '.';

/// Pause reason that is present whenever a view has no target to draw into
pub const PAUSE_NO_TARGET: &str = "No target";

// Default timings
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;
pub const DEFAULT_STICKY_DELAY_MS: u64 = 10;
pub const MAX_DELAY_MS: u64 = 60_000;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(DEFAULT_DEBOUNCE_MS);
pub const DEFAULT_STICKY_DELAY: Duration = Duration::from_millis(DEFAULT_STICKY_DELAY_MS);

// Files and directories
pub const APP_DIR_NAME: &str = "uki";
pub const LOCAL_CONFIG_FILE: &str = "uki.toml";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const LOG_FILE_NAME: &str = "uki.log";

// Messages
pub const CONFIG_GENERATED: &str = "✅ Generated default configuration";
pub const DEFAULT_USER_AGENT: &str = concat!("uki/", env!("CARGO_PKG_VERSION"));

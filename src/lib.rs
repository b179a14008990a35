//! uki - a minimal model/view runtime
//!
//! Components declare the external resources they need, listen to and emit
//! named events, and render into a visual target on a debounced schedule.
//!
//! # Modules
//!
//! * [`resources`] - Resource declarations, dependency-ordered loading and the shared load cache
//! * [`events`] - Deferred, cancellable, namespaced events
//! * [`render`] - The render scheduler and the [`View`] lifecycle
//! * [`component`] - Capability traits and the [`Model`]/[`Component`] types
//! * [`config`] - Application configuration management
//! * [`logger`] - Logging setup

/// Capability traits, models and components
pub mod component;

/// Configuration module for managing application settings
pub mod config;

/// Event names, default timings and other constants
pub mod constants;

/// Named events with deferred delivery
pub mod events;

/// Logging utilities
pub mod logger;

/// Debounced rendering into visual targets
pub mod render;

/// Resource declarations and loading
pub mod resources;

mod utils;

pub use component::{Component, ComponentOptions, Loadable, Model, Observable, Renderable};
pub use events::{Dispatch, EventBus, EventContext, Listener};
pub use render::{RenderContext, RenderError, Renderer, Target, View};
pub use resources::{Declaration, LoadError, LoadedResources, Resource, ResourceKind, ResourceLoader};

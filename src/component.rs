//! Components: an event bus, a set of loaded resources, and optionally a view.
//!
//! Capabilities are split into traits so that code can depend on only what it
//! uses. [`Model`] is [`Observable`] and [`Loadable`]; [`Component`] adds a
//! [`Renderer`] and is also [`Renderable`].

use crate::config::Config;
use crate::constants::{DEFAULT_DEBOUNCE, DEFAULT_STICKY_DELAY, EVENT_LOAD};
use crate::events::{Dispatch, EventBus, Listener};
use crate::render::{RenderError, Renderer, Target, View};
use crate::resources::{Declaration, LoadError, LoadedResources, Resource, ResourceLoader};
use crate::utils::lock;
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Anything that owns an [`EventBus`].
pub trait Observable {
    fn events(&self) -> &EventBus;

    fn on(&self, name: &str, listener: Listener) {
        self.events().on(name, listener)
    }

    fn off(&self, name: &str, listener: Option<&Listener>) {
        self.events().off(name, listener)
    }

    fn trigger(&self, event: &str, args: Vec<Value>) -> Dispatch {
        self.events().trigger(event, args)
    }

    fn sticky_trigger(&self, event: &str, args: Map<String, Value>, delay: Option<Duration>) -> Dispatch {
        self.events().sticky_trigger(event, args, delay)
    }

    fn take_over_events(&self, other: &dyn Observable) {
        self.events().take_over_events(other.events())
    }
}

/// Anything whose readiness depends on loading resources.
#[async_trait]
pub trait Loadable: Observable + Send + Sync {
    /// Wait until the initial resources have loaded.
    async fn ready(&self) -> Result<(), LoadError>;

    /// False while the initial load or any late load is still running.
    fn resources_loaded(&self) -> bool;

    fn get_named_resource(&self, name: &str) -> Option<Resource>;

    /// Load one more resource after readiness. An existing name is an error
    /// unless `override_existing`, in which case its value is replaced.
    async fn load_late_resource(&self, declaration: Declaration, override_existing: bool)
        -> Result<Resource, LoadError>;

    /// Replace the value of a named resource. Unknown names are an error unless `allow_late`.
    async fn update_resource(&self, declaration: Declaration, allow_late: bool) -> Result<Resource, LoadError>;
}

/// Anything that can be rendered into a [`Target`].
#[async_trait]
pub trait Renderable: Loadable {
    type Output: Send + 'static;

    async fn render(&self, target: Option<Target>) -> Result<Self::Output, RenderError>;

    fn pause_render(&self, reason: &str);

    fn resume_render(&self, reason: Option<&str>);
}

#[derive(Default)]
struct ModelState {
    resources: LoadedResources,
    loaded: bool,
    in_flight: usize,
    /// Names of late resources whose load has not settled yet
    reserved: HashSet<String>,
}

struct ModelInner {
    events: EventBus,
    loader: ResourceLoader,
    state: Mutex<ModelState>,
    ready: watch::Receiver<Option<Result<(), LoadError>>>,
}

/// Events plus resources; the non-visual half of a component.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

/// Counts a late load as in flight until dropped.
struct InFlight<'a>(&'a Mutex<ModelState>);

impl<'a> InFlight<'a> {
    fn enter(state: &'a Mutex<ModelState>) -> Self {
        lock(state).in_flight += 1;
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = lock(self.0);
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

/// Holds a late resource's name until its load settles.
struct NameReservation<'a> {
    state: &'a Mutex<ModelState>,
    name: Option<String>,
}

impl Drop for NameReservation<'_> {
    fn drop(&mut self) {
        if let Some(name) = &self.name {
            lock(self.state).reserved.remove(name);
        }
    }
}

impl Model {
    /// Start loading `declarations`.
    ///
    /// Configuration errors are returned here; load failures surface through
    /// [`Loadable::ready`]. Emits `load` once everything resolved.
    pub fn new(loader: ResourceLoader, declarations: Vec<Declaration>) -> Result<Self, LoadError> {
        Self::with_events(EventBus::new(), loader, declarations)
    }

    pub fn with_events(
        events: EventBus,
        loader: ResourceLoader,
        declarations: Vec<Declaration>,
    ) -> Result<Self, LoadError> {
        let load = loader.start(declarations)?;
        let (sender, ready) = watch::channel(None);
        let model = Self {
            inner: Arc::new(ModelInner {
                events,
                loader,
                state: Mutex::new(ModelState::default()),
                ready,
            }),
        };

        let loading = model.clone();
        tokio::spawn(async move {
            match load.await {
                Ok(resources) => {
                    {
                        let mut state = lock(&loading.inner.state);
                        state.resources = resources;
                        state.loaded = true;
                    }
                    let _ = loading.trigger(EVENT_LOAD, Vec::new());
                    let _ = sender.send(Some(Ok(())));
                }
                Err(e) => {
                    warn!("Resources failed to load: {}", e);
                    let _ = sender.send(Some(Err(e)));
                }
            }
        });

        Ok(model)
    }

    pub fn loader(&self) -> &ResourceLoader {
        &self.inner.loader
    }

    /// Snapshot of the resolved resources, in declaration order followed by late ones
    pub fn resources(&self) -> LoadedResources {
        lock(&self.inner.state).resources.clone()
    }

    fn index_of(&self, declaration: &Declaration) -> Option<usize> {
        let name = declaration.name.as_deref()?;
        lock(&self.inner.state).resources.index_of(name)
    }

    async fn append_resource(&self, declaration: Declaration) -> Result<Resource, LoadError> {
        let _reservation = {
            let mut state = lock(&self.inner.state);
            if let Some(missing) = declaration
                .load_after
                .iter()
                .find(|name| !state.resources.contains(name))
            {
                return Err(LoadError::UnknownDependency(missing.clone()));
            }
            if let Some(name) = declaration.name.as_deref() {
                if state.resources.contains(name) || !state.reserved.insert(name.to_string()) {
                    return Err(LoadError::AlreadyExists(declaration.label()));
                }
            }
            NameReservation {
                state: &self.inner.state,
                name: declaration.name.clone(),
            }
        };

        let name = declaration.name.clone();
        let resource = self.load_tracked(declaration).await?;
        let index = lock(&self.inner.state)
            .resources
            .push(name.as_deref(), resource.clone());
        debug!("Late resource stored at index {}", index);
        let _ = self.trigger(EVENT_LOAD, Vec::new());
        Ok(resource)
    }

    async fn replace_resource(&self, index: usize, declaration: Declaration) -> Result<Resource, LoadError> {
        let resource = self.load_tracked(declaration).await?;
        lock(&self.inner.state).resources.replace(index, resource.clone());
        debug!("Resource at index {} updated", index);
        let _ = self.trigger(EVENT_LOAD, Vec::new());
        Ok(resource)
    }

    async fn load_tracked(&self, declaration: Declaration) -> Result<Resource, LoadError> {
        let _in_flight = InFlight::enter(&self.inner.state);
        self.inner.loader.load_one(declaration).await
    }
}

impl Observable for Model {
    fn events(&self) -> &EventBus {
        &self.inner.events
    }
}

#[async_trait]
impl Loadable for Model {
    async fn ready(&self) -> Result<(), LoadError> {
        let mut ready = self.inner.ready.clone();
        let outcome = match ready.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(LoadError::Aborted("resources".to_string())))
    }

    fn resources_loaded(&self) -> bool {
        let state = lock(&self.inner.state);
        state.loaded && state.in_flight == 0
    }

    fn get_named_resource(&self, name: &str) -> Option<Resource> {
        lock(&self.inner.state).resources.get_named(name).cloned()
    }

    async fn load_late_resource(
        &self,
        declaration: Declaration,
        override_existing: bool,
    ) -> Result<Resource, LoadError> {
        self.ready().await?;
        match self.index_of(&declaration) {
            Some(index) if override_existing => self.replace_resource(index, declaration).await,
            Some(_) => Err(LoadError::AlreadyExists(declaration.label())),
            None => self.append_resource(declaration).await,
        }
    }

    async fn update_resource(&self, declaration: Declaration, allow_late: bool) -> Result<Resource, LoadError> {
        self.ready().await?;
        match self.index_of(&declaration) {
            Some(index) => self.replace_resource(index, declaration).await,
            None if allow_late => self.append_resource(declaration).await,
            None => Err(LoadError::UnknownResource(declaration.label())),
        }
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("events", &self.inner.events)
            .field("resources_loaded", &self.resources_loaded())
            .finish_non_exhaustive()
    }
}

/// How a [`Component`] is put together.
#[derive(Debug, Clone)]
pub struct ComponentOptions {
    pub resources: Vec<Declaration>,
    pub target: Option<Target>,
    pub debounce: Duration,
    pub sticky_delay: Duration,
    pub suppress_initial_render: bool,
}

impl Default for ComponentOptions {
    fn default() -> Self {
        Self {
            resources: Vec::new(),
            target: None,
            debounce: DEFAULT_DEBOUNCE,
            sticky_delay: DEFAULT_STICKY_DELAY,
            suppress_initial_render: false,
        }
    }
}

impl ComponentOptions {
    /// Timings and initial render behaviour taken from `config`
    pub fn from_config(config: &Config) -> Self {
        Self {
            debounce: config.render.debounce(),
            sticky_delay: config.events.sticky_delay(),
            suppress_initial_render: !config.render.initial_render,
            ..Self::default()
        }
    }

    pub fn resources(mut self, resources: Vec<Declaration>) -> Self {
        self.resources = resources;
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn sticky_delay(mut self, delay: Duration) -> Self {
        self.sticky_delay = delay;
        self
    }

    pub fn suppress_initial_render(mut self) -> Self {
        self.suppress_initial_render = true;
        self
    }
}

/// A model with a view attached.
pub struct Component<V: View> {
    model: Model,
    renderer: Renderer<V>,
}

impl<V: View> Clone for Component<V> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            renderer: self.renderer.clone(),
        }
    }
}

impl<V: View> Component<V> {
    /// Start loading resources, claim the target if one is given, and render
    /// once unless the initial render is suppressed.
    pub fn new(view: V, loader: &ResourceLoader, options: ComponentOptions) -> Result<Self, LoadError> {
        let events = EventBus::with_sticky_delay(options.sticky_delay);
        let model = Model::with_events(events, loader.clone(), options.resources)?;
        let renderer = Renderer::with_debounce(view, model.clone(), options.debounce);

        if let Some(target) = options.target {
            renderer.claim_target(target, false);
        }
        if !options.suppress_initial_render {
            renderer.spawn_render();
        }

        Ok(Self { model, renderer })
    }

    /// Build one component per target with `factory` and render each into its
    /// target, resolving once every first draw has finished.
    pub async fn init_for_targets<F>(targets: Vec<Target>, mut factory: F) -> Result<Vec<(Self, V::Output)>, RenderError>
    where
        F: FnMut(&Target) -> Result<Self, LoadError>,
    {
        let mut renders = Vec::with_capacity(targets.len());
        for target in targets {
            let component = factory(&target)?;
            let rendering = component.clone();
            let handle = tokio::spawn(async move { rendering.renderer.render(Some(target)).await });
            renders.push((component, handle));
        }

        let mut rendered = Vec::with_capacity(renders.len());
        for (component, handle) in renders {
            let output = handle.await.map_err(|_| RenderError::Closed)??;
            rendered.push((component, output));
        }
        Ok(rendered)
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn renderer(&self) -> &Renderer<V> {
        &self.renderer
    }

    pub fn view(&self) -> &V {
        self.renderer.view()
    }

    pub fn target(&self) -> Option<Target> {
        self.renderer.target()
    }

    pub fn is_render_paused(&self) -> bool {
        self.renderer.is_paused()
    }

    /// Adopt `target` and render into it
    pub fn claim_target(&self, target: Target) -> bool {
        self.renderer.claim_target(target, true)
    }

    pub fn revoke_target(&self) {
        self.renderer.revoke_target()
    }
}

impl<V: View> Observable for Component<V> {
    fn events(&self) -> &EventBus {
        self.model.events()
    }
}

#[async_trait]
impl<V: View> Loadable for Component<V> {
    async fn ready(&self) -> Result<(), LoadError> {
        self.model.ready().await
    }

    fn resources_loaded(&self) -> bool {
        self.model.resources_loaded()
    }

    fn get_named_resource(&self, name: &str) -> Option<Resource> {
        self.model.get_named_resource(name)
    }

    async fn load_late_resource(
        &self,
        declaration: Declaration,
        override_existing: bool,
    ) -> Result<Resource, LoadError> {
        self.model.load_late_resource(declaration, override_existing).await
    }

    async fn update_resource(&self, declaration: Declaration, allow_late: bool) -> Result<Resource, LoadError> {
        self.model.update_resource(declaration, allow_late).await
    }
}

#[async_trait]
impl<V: View> Renderable for Component<V> {
    type Output = V::Output;

    async fn render(&self, target: Option<Target>) -> Result<V::Output, RenderError> {
        self.renderer.render(target).await
    }

    fn pause_render(&self, reason: &str) {
        self.renderer.pause_render(reason)
    }

    fn resume_render(&self, reason: Option<&str>) {
        self.renderer.resume_render(reason)
    }
}

impl<V: View> fmt::Debug for Component<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("model", &self.model)
            .field("renderer", &self.renderer)
            .finish()
    }
}

//! Debounced, pausable rendering of a component into a [`Target`].
//!
//! A [`Renderer`] drives a [`View`] through its lifecycle: `setup` runs once
//! per dirty cycle (a new target makes the renderer dirty), `draw` runs after
//! the debounce window closes. Every caller of [`Renderer::render`] inside one
//! window is answered with the result of the same draw.
//!
//! Rendering is blocked while any pause reason is recorded. Losing the target
//! (removed, or claimed by another renderer) records the `"No target"` reason.

pub mod target;

use crate::component::{Loadable, Model, Observable};
use crate::constants::{
    DEFAULT_DEBOUNCE, EVENT_DRAW_FINISHED, EVENT_PAUSE_RENDER, EVENT_RESUME_RENDER, EVENT_SETUP_FINISHED,
    PAUSE_NO_TARGET,
};
use crate::resources::LoadError;
use crate::utils::lock;
use async_trait::async_trait;
use log::{debug, error, warn};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use target::{Target, TargetState};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RenderError {
    #[error("Resources failed to load: {0}")]
    Load(#[from] LoadError),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Draw failed: {0}")]
    Draw(String),

    #[error("Renderer was dropped before the render completed")]
    Closed,
}

/// What lifecycle hooks receive.
#[derive(Debug, Clone)]
pub struct RenderContext {
    pub target: Target,
    pub model: Model,
}

/// The drawing half of a component.
///
/// `setup_error` and `draw_error` may recover from a failing hook; their
/// defaults hand the error back unchanged.
#[async_trait]
pub trait View: Send + Sync + 'static {
    type Output: Clone + Send + Sync + 'static;

    async fn setup(&self, _context: &RenderContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn draw(&self, context: &RenderContext) -> anyhow::Result<Self::Output>;

    async fn setup_error(&self, _context: &RenderContext, error: anyhow::Error) -> anyhow::Result<()> {
        Err(error)
    }

    async fn draw_error(&self, _context: &RenderContext, error: anyhow::Error) -> anyhow::Result<Self::Output> {
        Err(error)
    }
}

type Resolver<O> = oneshot::Sender<Result<O, RenderError>>;
type SetupOutcome = Option<Result<(), RenderError>>;

struct RenderState<O> {
    target: Option<Target>,
    watcher: Option<JoinHandle<()>>,
    dirty: bool,
    /// Present while a setup is in flight
    setup: Option<watch::Receiver<SetupOutcome>>,
    pause_reasons: BTreeSet<String>,
    resolvers: Vec<Resolver<O>>,
    draw_timer: Option<JoinHandle<()>>,
    draw_generation: u64,
}

impl<O> RenderState<O> {
    fn is_paused(&self) -> bool {
        !self.pause_reasons.is_empty() || self.target.is_none()
    }
}

struct RendererInner<V: View> {
    id: Uuid,
    view: V,
    model: Model,
    debounce: Duration,
    state: Mutex<RenderState<V::Output>>,
}

/// Render scheduler for one view.
pub struct Renderer<V: View> {
    inner: Arc<RendererInner<V>>,
}

impl<V: View> Clone for Renderer<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: View> Renderer<V> {
    pub fn new(view: V, model: Model) -> Self {
        Self::with_debounce(view, model, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(view: V, model: Model, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(RendererInner {
                id: Uuid::new_v4(),
                view,
                model,
                debounce,
                state: Mutex::new(RenderState {
                    target: None,
                    watcher: None,
                    dirty: true,
                    setup: None,
                    pause_reasons: BTreeSet::from([PAUSE_NO_TARGET.to_string()]),
                    resolvers: Vec::new(),
                    draw_timer: None,
                    draw_generation: 0,
                }),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn view(&self) -> &V {
        &self.inner.view
    }

    pub fn model(&self) -> &Model {
        &self.inner.model
    }

    pub fn target(&self) -> Option<Target> {
        lock(&self.inner.state).target.clone()
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.inner.state).is_paused()
    }

    pub fn pause_reasons(&self) -> Vec<String> {
        lock(&self.inner.state).pause_reasons.iter().cloned().collect()
    }

    pub fn is_dirty(&self) -> bool {
        lock(&self.inner.state).dirty
    }

    /// Render, resolving with the result of the next completed draw.
    ///
    /// A `target` different from the current one is claimed first. While
    /// paused the call stays queued until a later render completes a draw.
    pub async fn render(&self, target: Option<Target>) -> Result<V::Output, RenderError> {
        if let Some(target) = target {
            self.claim_target(target, false);
        }

        self.inner.model.ready().await?;

        let (resolver, completion) = oneshot::channel();
        let mut resolver = Some(resolver);
        let setup = {
            let mut state = lock(&self.inner.state);
            if state.is_paused() {
                debug!("Render paused ({:?}), queueing caller", state.pause_reasons);
                state.resolvers.extend(resolver.take());
                None
            } else if state.dirty && state.setup.is_none() {
                let (sender, receiver) = watch::channel(None);
                state.setup = Some(receiver);
                state.dirty = false;
                state.target.clone().map(|target| (sender, target))
            } else {
                None
            }
        };

        if resolver.is_none() {
            return settle(completion).await;
        }
        if let Some((sender, target)) = setup {
            self.run_setup(sender, target).await?;
        }

        {
            let mut state = lock(&self.inner.state);
            state.resolvers.extend(resolver.take());
            if let Some(timer) = state.draw_timer.take() {
                timer.abort();
            }
            state.draw_generation += 1;
            let generation = state.draw_generation;
            state.draw_timer = Some(tokio::spawn(self.clone().draw_after_debounce(generation)));
        }

        settle(completion).await
    }

    /// Record `reason` and block rendering until it is resumed.
    pub fn pause_render(&self, reason: &str) {
        lock(&self.inner.state).pause_reasons.insert(reason.to_string());
        debug!("Render paused: {}", reason);
        let _ = self
            .inner
            .model
            .events()
            .trigger(EVENT_PAUSE_RENDER, vec![Value::String(reason.to_string())]);
    }

    /// Remove `reason`, or every reason when `None`, and render again once nothing blocks.
    ///
    /// `resumeRender` is emitted once per removed reason, with that reason.
    pub fn resume_render(&self, reason: Option<&str>) {
        let (resumed, unpaused) = {
            let mut state = lock(&self.inner.state);
            let resumed: Vec<String> = match reason {
                Some(reason) if state.pause_reasons.remove(reason) => vec![reason.to_string()],
                Some(_) => Vec::new(),
                None => {
                    let mut cleared = std::mem::take(&mut state.pause_reasons);
                    if state.target.is_none() && cleared.remove(PAUSE_NO_TARGET) {
                        state.pause_reasons.insert(PAUSE_NO_TARGET.to_string());
                    }
                    cleared.into_iter().collect()
                }
            };
            (resumed, !state.is_paused())
        };

        for reason in resumed {
            debug!("Render resumed: {}", reason);
            self.emit_resumed(reason);
        }
        if unpaused {
            self.spawn_render();
        }
    }

    fn emit_resumed(&self, reason: String) {
        let _ = self
            .inner
            .model
            .events()
            .trigger(EVENT_RESUME_RENDER, vec![Value::String(reason)]);
    }

    /// Take ownership of `target`, revoking it from any renderer that had it.
    ///
    /// Returns whether the target was adopted. Removed targets are ignored.
    pub fn claim_target(&self, target: Target, render_after: bool) -> bool {
        if target.is_removed() {
            warn!("Ignoring removed target '{}'", target.label());
            return false;
        }

        let (previous_owner, attached) = {
            let mut state = lock(&self.inner.state);
            let current = state.target.as_ref() == Some(&target) && target.owner() == Some(self.inner.id);
            if current {
                return false;
            }

            let previous_owner = target.claim(self.inner.id);
            if let Some(old) = state.target.replace(target.clone()) {
                if old != target {
                    old.release(self.inner.id);
                }
            }
            if let Some(watcher) = state.watcher.take() {
                watcher.abort();
            }
            state.watcher = Some(self.watch_target(&target));
            state.dirty = true;
            let attached = state.pause_reasons.remove(PAUSE_NO_TARGET);
            (previous_owner, attached)
        };

        match previous_owner {
            Some(previous) => debug!("Renderer {} took '{}' over from {}", self.inner.id, target.label(), previous),
            None => debug!("Renderer {} claimed '{}'", self.inner.id, target.label()),
        }

        if attached {
            self.emit_resumed(PAUSE_NO_TARGET.to_string());
        }
        if render_after {
            self.spawn_render();
        }
        true
    }

    /// Give up the current target and pause with the no-target reason.
    pub fn revoke_target(&self) {
        let revoked = {
            let mut state = lock(&self.inner.state);
            if let Some(watcher) = state.watcher.take() {
                watcher.abort();
            }
            state.target.take()
        };
        if let Some(target) = revoked {
            target.release(self.inner.id);
            debug!("Renderer {} lost '{}'", self.inner.id, target.label());
        }
        self.pause_render(PAUSE_NO_TARGET);
    }

    fn revoke_if_current(&self, target_id: Uuid) {
        let current = lock(&self.inner.state)
            .target
            .as_ref()
            .is_some_and(|target| target.id() == target_id);
        if current {
            self.revoke_target();
        }
    }

    fn watch_target(&self, target: &Target) -> JoinHandle<()> {
        let mut changes = target.subscribe();
        let renderer = Arc::downgrade(&self.inner);
        let owner = self.inner.id;
        let target_id = target.id();

        tokio::spawn(async move {
            let lost = changes
                .wait_for(|state| state.removed || state.owner != Some(owner))
                .await
                .is_ok();
            if !lost {
                return;
            }
            if let Some(inner) = renderer.upgrade() {
                Renderer { inner }.revoke_if_current(target_id);
            }
        })
    }

    pub(crate) fn spawn_render(&self) {
        let renderer = self.clone();
        tokio::spawn(async move {
            if let Err(e) = renderer.render(None).await {
                debug!("Background render failed: {}", e);
            }
        });
    }

    fn context(&self, target: Target) -> RenderContext {
        RenderContext {
            target,
            model: self.inner.model.clone(),
        }
    }

    async fn run_setup(&self, sender: watch::Sender<SetupOutcome>, target: Target) -> Result<(), RenderError> {
        let context = self.context(target);
        let outcome = match self.inner.view.setup(&context).await {
            Ok(()) => Ok(()),
            Err(e) => self
                .inner
                .view
                .setup_error(&context, e)
                .await
                .map_err(|e| RenderError::Setup(format!("{:#}", e))),
        };

        let failed = {
            let mut state = lock(&self.inner.state);
            state.setup = None;
            match outcome {
                Ok(()) => Vec::new(),
                Err(_) => {
                    state.dirty = true;
                    std::mem::take(&mut state.resolvers)
                }
            }
        };
        let _ = sender.send(Some(outcome.clone()));

        match outcome {
            Ok(()) => {
                let _ = self.inner.model.events().trigger(EVENT_SETUP_FINISHED, Vec::new());
                Ok(())
            }
            Err(e) => {
                error!("{}", e);
                for resolver in failed {
                    let _ = resolver.send(Err(e.clone()));
                }
                Err(e)
            }
        }
    }

    async fn draw_after_debounce(self, generation: u64) {
        tokio::time::sleep(self.inner.debounce).await;

        let setup = {
            let mut state = lock(&self.inner.state);
            if state.draw_generation != generation {
                return;
            }
            state.draw_timer = None;
            state.setup.clone()
        };

        if let Some(mut setup) = setup {
            // A failing setup already answered its callers.
            let failed = match setup.wait_for(Option::is_some).await {
                Ok(outcome) => !matches!(*outcome, Some(Ok(()))),
                Err(_) => true,
            };
            if failed {
                return;
            }
        }

        let (resolvers, target) = {
            let mut state = lock(&self.inner.state);
            if state.draw_generation != generation {
                return;
            }
            if state.is_paused() {
                debug!("Draw skipped, render paused ({:?})", state.pause_reasons);
                return;
            }
            match state.target.clone() {
                Some(target) => (std::mem::take(&mut state.resolvers), target),
                None => return,
            }
        };

        let context = self.context(target);
        let outcome = match self.inner.view.draw(&context).await {
            Ok(output) => Ok(output),
            Err(e) => self
                .inner
                .view
                .draw_error(&context, e)
                .await
                .map_err(|e| RenderError::Draw(format!("{:#}", e))),
        };

        match &outcome {
            Ok(_) => {
                let _ = self.inner.model.events().trigger(EVENT_DRAW_FINISHED, Vec::new());
            }
            Err(e) => error!("{}", e),
        }
        debug!("Draw answered {} callers", resolvers.len());
        for resolver in resolvers {
            let _ = resolver.send(outcome.clone());
        }
    }
}

impl<V: View> fmt::Debug for Renderer<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Renderer")
            .field("id", &self.inner.id)
            .field("debounce", &self.inner.debounce)
            .finish_non_exhaustive()
    }
}

async fn settle<O>(completion: oneshot::Receiver<Result<O, RenderError>>) -> Result<O, RenderError> {
    completion.await.unwrap_or(Err(RenderError::Closed))
}

//! Dependency-ordered resource loading.
//!
//! [`ResourceLoader::start`] validates a declaration list and sorts it
//! topologically (Kahn's algorithm over the `load_after` edges) before any
//! I/O happens, so configuration errors surface to the caller immediately.
//! Each declaration then gets its own task that waits for its direct
//! dependencies, runs the kind-specific strategy and applies `then`.
//! Unrelated declarations load concurrently.

use super::cache::{abbreviate, settled, Outcome};
use super::fetchers::{DataRequest, FetcherRegistry};
use super::host::{Document, FetchInit, FetchResponse, Network, NodeId, NodeTag, StylesheetCompiler};
use super::{
    css, CacheBucket, Declaration, LoadError, LoadedResources, Resource, ResourceCache, ResourceKind, Script,
    StyleSheet,
};
use crate::config::LoaderConfig;
use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Validated load order for a declaration list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadPlan {
    /// Declaration indices in the order their loads are started
    pub order: Vec<usize>,
    /// Direct dependencies of each declaration, by index
    pub dependencies: Vec<Vec<usize>>,
    /// Name to index lookup
    pub lookup: HashMap<String, usize>,
}

struct LoadContext {
    document: Document,
    network: Arc<dyn Network>,
    cache: ResourceCache,
    fetchers: FetcherRegistry,
    compiler: Option<Arc<dyn StylesheetCompiler>>,
    compiler_script: Option<String>,
}

/// Loads declaration lists for components.
#[derive(Clone)]
pub struct ResourceLoader {
    context: Arc<LoadContext>,
}

/// Builder for a [`ResourceLoader`] with non-default collaborators.
pub struct LoaderBuilder {
    network: Arc<dyn Network>,
    document: Option<Document>,
    cache: Option<ResourceCache>,
    fetchers: FetcherRegistry,
    compiler: Option<Arc<dyn StylesheetCompiler>>,
    compiler_script: Option<String>,
}

impl LoaderBuilder {
    pub fn document(mut self, document: Document) -> Self {
        self.document = Some(document);
        self
    }

    pub fn cache(mut self, cache: ResourceCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn fetchers(mut self, fetchers: FetcherRegistry) -> Self {
        self.fetchers = fetchers;
        self
    }

    pub fn compiler(mut self, compiler: Arc<dyn StylesheetCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Script loaded once before the first compilation; defaults to the compiler's own
    pub fn compiler_script(mut self, locator: Option<String>) -> Self {
        self.compiler_script = locator;
        self
    }

    pub fn build(self) -> ResourceLoader {
        let compiler_script = self
            .compiler_script
            .or_else(|| self.compiler.as_ref().and_then(|compiler| compiler.script()));

        ResourceLoader {
            context: Arc::new(LoadContext {
                document: self.document.unwrap_or_default(),
                network: self.network,
                cache: self.cache.unwrap_or_else(ResourceCache::global),
                fetchers: self.fetchers,
                compiler: self.compiler,
                compiler_script,
            }),
        }
    }
}

impl ResourceLoader {
    /// A loader over `network` with a fresh document, the global cache and the default fetchers
    pub fn new(network: Arc<dyn Network>) -> Self {
        Self::builder(network).build()
    }

    pub fn builder(network: Arc<dyn Network>) -> LoaderBuilder {
        LoaderBuilder {
            network,
            document: None,
            cache: None,
            fetchers: FetcherRegistry::default(),
            compiler: None,
            compiler_script: None,
        }
    }

    pub fn from_config(config: &LoaderConfig, network: Arc<dyn Network>) -> Self {
        Self::builder(network)
            .compiler_script(config.compiler_script.clone())
            .build()
    }

    pub fn document(&self) -> &Document {
        &self.context.document
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.context.cache
    }

    /// Validate `declarations` and compute their load order.
    pub fn plan(&self, declarations: &[Declaration]) -> Result<LoadPlan, LoadError> {
        let mut lookup = HashMap::new();
        for (index, declaration) in declarations.iter().enumerate() {
            if let Some(name) = &declaration.name {
                if lookup.insert(name.clone(), index).is_some() {
                    return Err(LoadError::DuplicateName(name.clone()));
                }
            }
        }

        for declaration in declarations {
            self.check_supported(declaration)?;
        }

        let mut dependencies = Vec::with_capacity(declarations.len());
        for declaration in declarations {
            let mut parents: Vec<usize> = Vec::new();
            for name in &declaration.load_after {
                let parent = *lookup
                    .get(name)
                    .ok_or_else(|| LoadError::UnknownDependency(name.clone()))?;
                if !parents.contains(&parent) {
                    parents.push(parent);
                }
            }
            dependencies.push(parents);
        }

        let order = topological_order(&dependencies)?;
        Ok(LoadPlan {
            order,
            dependencies,
            lookup,
        })
    }

    /// Load `declarations`, resolving to one value per declaration in declaration order.
    pub async fn load(&self, declarations: Vec<Declaration>) -> Result<LoadedResources, LoadError> {
        self.start(declarations)?.await
    }

    /// Plan synchronously and start every load.
    ///
    /// Configuration errors are returned before anything is loaded. The
    /// returned future resolves once every declaration has settled, or fails
    /// as soon as any declaration fails.
    pub fn start(
        &self,
        declarations: Vec<Declaration>,
    ) -> Result<impl Future<Output = Result<LoadedResources, LoadError>> + Send + 'static, LoadError> {
        let plan = self.plan(&declarations)?;
        let count = declarations.len();
        let mut slots: Vec<Option<watch::Receiver<Outcome>>> = vec![None; count];

        for &index in &plan.order {
            // Parents always precede their children in the topological order.
            let parents: Vec<(watch::Receiver<Outcome>, String)> = plan.dependencies[index]
                .iter()
                .filter_map(|&parent| {
                    slots[parent]
                        .clone()
                        .map(|receiver| (receiver, declarations[parent].label()))
                })
                .collect();

            let (sender, receiver) = watch::channel(None);
            slots[index] = Some(receiver);

            let declaration = declarations[index].clone();
            let context = self.context.clone();
            tokio::spawn(async move {
                for (parent, label) in parents {
                    if let Err(error) = settled(parent, label).await {
                        let _ = sender.send(Some(Err(error)));
                        return;
                    }
                }
                let outcome = context.resolve(declaration).await;
                let _ = sender.send(Some(outcome));
            });
        }

        let labels: Vec<String> = declarations.iter().map(Declaration::label).collect();
        let LoadPlan { order, lookup, .. } = plan;

        Ok(async move {
            // Outcomes arrive in settle order; the first failure rejects the whole load.
            let mut waiting = JoinSet::new();
            for index in order {
                if let Some(receiver) = slots[index].take() {
                    let label = labels[index].clone();
                    waiting.spawn(async move { (index, settled(receiver, label).await) });
                }
            }

            let mut values: Vec<Option<Resource>> = vec![None; count];
            while let Some(joined) = waiting.join_next().await {
                match joined {
                    Ok((index, Ok(resource))) => values[index] = Some(resource),
                    Ok((_, Err(error))) => return Err(error),
                    Err(e) => return Err(LoadError::Aborted(e.to_string())),
                }
            }
            let values: Vec<Resource> = values.into_iter().flatten().collect();
            info!("Loaded {} resources", values.len());
            Ok(LoadedResources::new(values, lookup))
        })
    }

    /// Load a single declaration outside any ordering, as late resources are.
    pub async fn load_one(&self, declaration: Declaration) -> Result<Resource, LoadError> {
        self.check_supported(&declaration)?;
        self.context.clone().resolve(declaration).await
    }

    fn check_supported(&self, declaration: &Declaration) -> Result<(), LoadError> {
        declaration.validate()?;
        match &declaration.kind {
            ResourceKind::CompiledStylesheet if self.context.compiler.is_none() => Err(LoadError::NoCompiler),
            ResourceKind::Data(kind) if self.context.fetchers.get(kind).is_none() => {
                Err(LoadError::UnsupportedKind(kind.clone()))
            }
            _ => Ok(()),
        }
    }
}

/// Kahn's algorithm over `dependencies` (each entry lists its parents).
fn topological_order(dependencies: &[Vec<usize>]) -> Result<Vec<usize>, LoadError> {
    if dependencies.is_empty() {
        return Ok(Vec::new());
    }

    let mut remaining: Vec<Vec<usize>> = dependencies.to_vec();
    let mut ready: VecDeque<usize> = remaining
        .iter()
        .enumerate()
        .filter(|(_, parents)| parents.is_empty())
        .map(|(index, _)| index)
        .collect();

    if ready.is_empty() {
        return Err(LoadError::NoRoot);
    }

    let mut order = Vec::with_capacity(dependencies.len());
    while let Some(index) = ready.pop_front() {
        order.push(index);
        for (child, parents) in remaining.iter_mut().enumerate() {
            if let Some(position) = parents.iter().position(|&parent| parent == index) {
                parents.remove(position);
                if parents.is_empty() {
                    ready.push_back(child);
                }
            }
        }
    }

    if order.len() != dependencies.len() {
        return Err(LoadError::Cycle);
    }
    Ok(order)
}

fn stylesheet(node: NodeId, href: Option<String>, text: String) -> Resource {
    let variables = css::extract_variables(&text);
    Resource::Stylesheet(Arc::new(StyleSheet {
        node,
        href,
        text,
        variables,
    }))
}

impl LoadContext {
    async fn resolve(self: Arc<Self>, declaration: Declaration) -> Result<Resource, LoadError> {
        let label = declaration.label();
        let resource = self.clone().load_core(&declaration).await?;
        debug!("Resolved {}: {}", abbreviate(&label), resource.summary());

        match &declaration.then {
            None => Ok(resource),
            Some(then) if declaration.store_original_result => {
                if let Err(error) = then(resource.clone()) {
                    warn!("Post-processing of {} failed: {:#}", abbreviate(&label), error);
                }
                Ok(resource)
            }
            Some(then) => then(resource).map_err(|error| LoadError::PostProcess {
                resource: label,
                message: format!("{:#}", error),
            }),
        }
    }

    async fn load_core(self: Arc<Self>, declaration: &Declaration) -> Result<Resource, LoadError> {
        let attributes = declaration.extra_attributes.clone();
        match &declaration.kind {
            ResourceKind::Provided => declaration
                .provided
                .clone()
                .ok_or_else(|| LoadError::MissingContent(ResourceKind::Provided)),
            ResourceKind::Stylesheet => match (&declaration.locator, &declaration.raw) {
                (Some(href), _) => self.stylesheet_from_locator(href.clone(), attributes, declaration.prepend).await,
                (None, Some(raw)) => self.inline_stylesheet(raw.clone(), attributes, declaration.prepend).await,
                (None, None) => Err(LoadError::MissingContent(ResourceKind::Stylesheet)),
            },
            ResourceKind::CompiledStylesheet => self.compiled_stylesheet(declaration).await,
            ResourceKind::Fetch => {
                let locator = declaration
                    .locator
                    .as_deref()
                    .ok_or_else(|| LoadError::MissingContent(ResourceKind::Fetch))?;
                let init = declaration.init.clone().unwrap_or_default();
                let response = self.network.fetch(locator, &init).await?.error_for_status()?;
                Ok(Resource::Response(Arc::new(response)))
            }
            ResourceKind::Script => {
                self.script(declaration.locator.clone(), declaration.raw.clone(), attributes)
                    .await
            }
            ResourceKind::Data(kind) => {
                let fetcher = self
                    .fetchers
                    .get(kind)
                    .ok_or_else(|| LoadError::UnsupportedKind(kind.clone()))?;
                let locator = declaration
                    .locator
                    .as_deref()
                    .ok_or_else(|| LoadError::MissingContent(declaration.kind.clone()))?;
                let init = declaration.init.clone().unwrap_or_default();
                let request = DataRequest {
                    locator,
                    init: &init,
                    delimiter: declaration.delimiter,
                    row: declaration.row.as_ref(),
                };
                let value = fetcher.fetch(self.network.as_ref(), &request).await?;
                Ok(Resource::Data(value))
            }
        }
    }

    async fn stylesheet_from_locator(
        self: Arc<Self>,
        href: String,
        extra_attributes: BTreeMap<String, String>,
        prepend: bool,
    ) -> Result<Resource, LoadError> {
        let context = self.clone();
        let key = href.clone();
        self.cache
            .get_or_load(CacheBucket::Stylesheet, &key, move || async move {
                if let Some(existing) = context.document.find_link(&href) {
                    debug!("Stylesheet {} is already in the document", href);
                    return Ok(stylesheet(existing.id, Some(href), existing.text));
                }

                let mut attributes = BTreeMap::from([
                    ("rel".to_string(), "stylesheet".to_string()),
                    ("type".to_string(), "text/css".to_string()),
                    ("media".to_string(), "screen".to_string()),
                ]);
                attributes.extend(extra_attributes);
                attributes.insert("href".to_string(), href.clone());
                let node = context.document.insert(NodeTag::Link, attributes, String::new(), prepend);

                let response = context
                    .network
                    .fetch(&href, &FetchInit::default())
                    .await
                    .and_then(FetchResponse::error_for_status);
                match response {
                    Ok(response) => {
                        context.document.set_text(node, &response.body);
                        Ok(stylesheet(node, Some(href), response.body))
                    }
                    Err(error) => {
                        context.document.remove(node);
                        Err(error)
                    }
                }
            })
            .await
    }

    /// Inline text is inserted as soon as the load starts; identical text is only ever inserted once.
    fn inline_stylesheet(
        self: Arc<Self>,
        text: String,
        extra_attributes: BTreeMap<String, String>,
        prepend: bool,
    ) -> impl Future<Output = Result<Resource, LoadError>> + Send + 'static {
        let context = self.clone();
        self.cache.get_or_load(CacheBucket::RawStylesheet, &text.clone(), move || {
            let mut attributes = BTreeMap::from([("type".to_string(), "text/css".to_string())]);
            attributes.extend(extra_attributes);
            let node = context.document.insert(NodeTag::Style, attributes, text.clone(), prepend);
            let resource = stylesheet(node, None, text);
            async move { Ok(resource) }
        })
    }

    async fn compiled_stylesheet(self: Arc<Self>, declaration: &Declaration) -> Result<Resource, LoadError> {
        let compiler = self.compiler.clone().ok_or(LoadError::NoCompiler)?;
        self.clone().ensure_compiler_script().await?;

        let key = declaration
            .key()
            .ok_or_else(|| LoadError::MissingContent(ResourceKind::CompiledStylesheet))?
            .to_string();
        let locator = declaration.locator.clone();
        let raw = declaration.raw.clone().unwrap_or_default();
        let args: Map<String, Value> = declaration.compile_args.clone();
        let attributes = declaration.extra_attributes.clone();
        let prepend = declaration.prepend;
        let context = self.clone();

        self.cache
            .get_or_load(CacheBucket::CompiledStylesheet, &key, move || async move {
                let source = match locator {
                    Some(locator) => {
                        context
                            .network
                            .fetch(&locator, &FetchInit::default())
                            .await?
                            .error_for_status()?
                            .body
                    }
                    None => raw,
                };
                let compiled = compiler.compile(&source, &args).await?;
                context.inline_stylesheet(compiled, attributes, prepend).await
            })
            .await
    }

    async fn ensure_compiler_script(self: Arc<Self>) -> Result<(), LoadError> {
        match self.compiler_script.clone() {
            Some(locator) => self.script(Some(locator), None, BTreeMap::new()).await.map(|_| ()),
            None => Ok(()),
        }
    }

    async fn script(
        self: Arc<Self>,
        locator: Option<String>,
        raw: Option<String>,
        extra_attributes: BTreeMap<String, String>,
    ) -> Result<Resource, LoadError> {
        let key = locator
            .clone()
            .or_else(|| raw.clone())
            .ok_or_else(|| LoadError::MissingContent(ResourceKind::Script))?;
        let context = self.clone();

        self.cache
            .get_or_load(CacheBucket::Script, &key, move || async move {
                let mut attributes = BTreeMap::from([("type".to_string(), "application/javascript".to_string())]);
                attributes.extend(extra_attributes);

                match locator {
                    Some(src) => {
                        attributes.insert("src".to_string(), src.clone());
                        let node = context.document.insert(NodeTag::Script, attributes, String::new(), false);
                        let response = context
                            .network
                            .fetch(&src, &FetchInit::default())
                            .await
                            .and_then(FetchResponse::error_for_status);
                        match response {
                            Ok(response) => {
                                context.document.set_text(node, &response.body);
                                Ok(Resource::Script(Arc::new(Script {
                                    node,
                                    src: Some(src),
                                    text: response.body,
                                })))
                            }
                            Err(error) => {
                                context.document.remove(node);
                                Err(error)
                            }
                        }
                    }
                    None => {
                        let text = raw.unwrap_or_default();
                        let node = context.document.insert(NodeTag::Script, attributes, text.clone(), false);
                        Ok(Resource::Script(Arc::new(Script { node, src: None, text })))
                    }
                }
            })
            .await
    }
}

//! Resource declarations, resolved resources and loading errors.
//!
//! A [`Declaration`] describes one external asset a component needs before it
//! is ready: a stylesheet, a stylesheet that must be compiled first, a raw
//! network fetch, a script, or a structured data fetch (JSON, delimiter
//! separated values, plain text). Declarations are handed to the
//! [`ResourceLoader`](loader::ResourceLoader), which orders them by their
//! `load_after` constraints and produces one [`Resource`] per declaration.

pub mod cache;
pub mod css;
pub mod fetchers;
pub mod host;
pub mod loader;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

pub use cache::{CacheBucket, ResourceCache};
pub use fetchers::{DataFetcher, DataRequest, FetcherRegistry};
pub use host::{
    Document, FetchInit, FetchResponse, HeadNode, HttpNetwork, MemoryNetwork, Network, NodeId, NodeTag, StylesheetCompiler,
};
pub use loader::ResourceLoader;

/// Errors raised while planning or loading resources.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoadError {
    #[error("Can't load_after unknown resource: {0}")]
    UnknownDependency(String),

    #[error("Resource name '{0}' is declared more than once")]
    DuplicateName(String),

    #[error("No resource without load_after dependencies")]
    NoRoot,

    #[error("Cyclic load_after resource dependency")]
    Cycle,

    #[error("Either a locator or raw content is required for {0} resources")]
    MissingContent(ResourceKind),

    #[error("Only one of locator or raw content may be given for {0} resources")]
    ConflictingContent(ResourceKind),

    #[error("Can't load resource of unsupported kind '{0}'")]
    UnsupportedKind(String),

    #[error("No stylesheet compiler is configured")]
    NoCompiler,

    #[error("Resource {0} already exists, use override to overwrite")]
    AlreadyExists(String),

    #[error("Can't update unknown resource: {0}, allow late loading to create it anyway")]
    UnknownResource(String),

    #[error("Network error for {locator}: {message}")]
    Network { locator: String, message: String },

    #[error("Failed to parse {locator}: {message}")]
    Parse { locator: String, message: String },

    #[error("Failed to compile stylesheet: {0}")]
    Compile(String),

    #[error("Post-processing of {resource} failed: {message}")]
    PostProcess { resource: String, message: String },

    #[error("Load of {0} was abandoned before it settled")]
    Aborted(String),
}

impl LoadError {
    /// Configuration errors are fatal and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            LoadError::UnknownDependency(_)
                | LoadError::DuplicateName(_)
                | LoadError::NoRoot
                | LoadError::Cycle
                | LoadError::MissingContent(_)
                | LoadError::ConflictingContent(_)
                | LoadError::UnsupportedKind(_)
                | LoadError::NoCompiler
                | LoadError::AlreadyExists(_)
                | LoadError::UnknownResource(_)
        )
    }
}

/// The kind of a declared resource, selecting its load strategy.
///
/// Anything that is not one of the fixed kinds is a structured fetch delegated
/// to the [`FetcherRegistry`] under that name (`json`, `csv`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceKind {
    Stylesheet,
    CompiledStylesheet,
    Fetch,
    Script,
    Provided,
    Data(String),
}

impl ResourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceKind::Stylesheet => "css",
            ResourceKind::CompiledStylesheet => "less",
            ResourceKind::Fetch => "fetch",
            ResourceKind::Script => "js",
            ResourceKind::Provided => "provided",
            ResourceKind::Data(name) => name,
        }
    }
}

impl From<String> for ResourceKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "css" | "stylesheet" => ResourceKind::Stylesheet,
            "less" | "compiled-stylesheet" => ResourceKind::CompiledStylesheet,
            "fetch" | "network-fetch" => ResourceKind::Fetch,
            "js" | "script" => ResourceKind::Script,
            "provided" => ResourceKind::Provided,
            _ => ResourceKind::Data(value),
        }
    }
}

impl From<ResourceKind> for String {
    fn from(kind: ResourceKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A loaded stylesheet node.
#[derive(Debug, Clone, PartialEq)]
pub struct StyleSheet {
    pub node: NodeId,
    pub href: Option<String>,
    pub text: String,
    /// Custom properties declared in `:root` blocks
    pub variables: BTreeMap<String, String>,
}

/// A loaded script node.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub node: NodeId,
    pub src: Option<String>,
    pub text: String,
}

/// The settled value of one declaration.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Stylesheet(Arc<StyleSheet>),
    Script(Arc<Script>),
    Response(Arc<FetchResponse>),
    Data(Value),
}

impl Resource {
    pub fn as_data(&self) -> Option<&Value> {
        match self {
            Resource::Data(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_stylesheet(&self) -> Option<&StyleSheet> {
        match self {
            Resource::Stylesheet(sheet) => Some(sheet),
            _ => None,
        }
    }

    pub fn as_script(&self) -> Option<&Script> {
        match self {
            Resource::Script(script) => Some(script),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&FetchResponse> {
        match self {
            Resource::Response(response) => Some(response),
            _ => None,
        }
    }

    /// One-line description used by logs and the command line
    pub fn summary(&self) -> String {
        match self {
            Resource::Stylesheet(sheet) => format!(
                "stylesheet #{} ({} bytes, {} variables)",
                sheet.node.0,
                sheet.text.len(),
                sheet.variables.len()
            ),
            Resource::Script(script) => format!("script #{} ({} bytes)", script.node.0, script.text.len()),
            Resource::Response(response) => format!("response {} ({} bytes)", response.status, response.body.len()),
            Resource::Data(Value::Array(rows)) => format!("data ({} rows)", rows.len()),
            Resource::Data(value) => format!("data ({})", value_type(value)),
        }
    }
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Post-processing applied to a resolved value.
pub type ThenFn = Arc<dyn Fn(Resource) -> anyhow::Result<Resource> + Send + Sync>;

/// Per-row transform for delimiter separated data; `None` drops the row.
pub type RowFn = Arc<dyn Fn(Map<String, Value>) -> Option<Value> + Send + Sync>;

/// Description of one resource to load.
#[derive(Clone, Deserialize)]
pub struct Declaration {
    #[serde(rename = "type", alias = "kind")]
    pub kind: ResourceKind,
    #[serde(default, alias = "url")]
    pub locator: Option<String>,
    #[serde(default)]
    pub raw: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "loadAfter", alias = "load_after")]
    pub load_after: Vec<String>,
    #[serde(default, rename = "storeOriginalResult", alias = "store_original_result")]
    pub store_original_result: bool,
    #[serde(default, rename = "extraAttributes", alias = "extra_attributes")]
    pub extra_attributes: BTreeMap<String, String>,
    /// Insert stylesheets at the start of the head instead of the end
    #[serde(default, alias = "unshift")]
    pub prepend: bool,
    #[serde(default)]
    pub delimiter: Option<char>,
    #[serde(default)]
    pub init: Option<FetchInit>,
    #[serde(default, rename = "compileArgs", alias = "compile_args", alias = "lessArgs")]
    pub compile_args: Map<String, Value>,
    #[serde(skip)]
    pub then: Option<ThenFn>,
    #[serde(skip)]
    pub row: Option<RowFn>,
    #[serde(skip)]
    pub provided: Option<Resource>,
}

impl Declaration {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            locator: None,
            raw: None,
            name: None,
            load_after: Vec::new(),
            store_original_result: false,
            extra_attributes: BTreeMap::new(),
            prepend: false,
            delimiter: None,
            init: None,
            compile_args: Map::new(),
            then: None,
            row: None,
            provided: None,
        }
    }

    pub fn stylesheet(locator: impl Into<String>) -> Self {
        Self::new(ResourceKind::Stylesheet).with_locator(locator)
    }

    pub fn raw_stylesheet(css: impl Into<String>) -> Self {
        Self::new(ResourceKind::Stylesheet).with_raw(css)
    }

    pub fn compiled_stylesheet(locator: impl Into<String>) -> Self {
        Self::new(ResourceKind::CompiledStylesheet).with_locator(locator)
    }

    pub fn raw_compiled_stylesheet(source: impl Into<String>) -> Self {
        Self::new(ResourceKind::CompiledStylesheet).with_raw(source)
    }

    pub fn fetch(locator: impl Into<String>) -> Self {
        Self::new(ResourceKind::Fetch).with_locator(locator)
    }

    pub fn script(locator: impl Into<String>) -> Self {
        Self::new(ResourceKind::Script).with_locator(locator)
    }

    pub fn raw_script(source: impl Into<String>) -> Self {
        Self::new(ResourceKind::Script).with_raw(source)
    }

    /// Structured fetch through the fetcher registered under `kind`
    pub fn data(kind: impl Into<String>, locator: impl Into<String>) -> Self {
        Self::new(ResourceKind::from(kind.into())).with_locator(locator)
    }

    pub fn json(locator: impl Into<String>) -> Self {
        Self::data("json", locator)
    }

    pub fn csv(locator: impl Into<String>) -> Self {
        Self::data("csv", locator)
    }

    /// A value that is already available
    pub fn provided(resource: Resource) -> Self {
        let mut declaration = Self::new(ResourceKind::Provided);
        declaration.provided = Some(resource);
        declaration
    }

    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = Some(locator.into());
        self
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = Some(raw.into());
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn load_after<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.load_after.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn then<F>(mut self, then: F) -> Self
    where
        F: Fn(Resource) -> anyhow::Result<Resource> + Send + Sync + 'static,
    {
        self.then = Some(Arc::new(then));
        self
    }

    /// Run `then` as an observer only; the stored value stays the loaded one
    pub fn store_original_result(mut self) -> Self {
        self.store_original_result = true;
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_attributes.insert(key.into(), value.into());
        self
    }

    pub fn prepend(mut self) -> Self {
        self.prepend = true;
        self
    }

    pub fn delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = Some(delimiter);
        self
    }

    pub fn init(mut self, init: FetchInit) -> Self {
        self.init = Some(init);
        self
    }

    pub fn compile_args(mut self, args: Map<String, Value>) -> Self {
        self.compile_args = args;
        self
    }

    pub fn row<F>(mut self, row: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Option<Value> + Send + Sync + 'static,
    {
        self.row = Some(Arc::new(row));
        self
    }

    /// Human readable label: the name, else the locator, else the kind
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            name.clone()
        } else if let Some(locator) = &self.locator {
            locator.clone()
        } else {
            format!("<inline {}>", self.kind)
        }
    }

    /// Cache key: the locator, or the raw content itself
    pub fn key(&self) -> Option<&str> {
        self.locator.as_deref().or(self.raw.as_deref())
    }

    /// Check the locator/raw requirements of this declaration's kind.
    pub fn validate(&self) -> Result<(), LoadError> {
        match &self.kind {
            ResourceKind::Provided => {
                if self.provided.is_none() {
                    return Err(LoadError::MissingContent(self.kind.clone()));
                }
            }
            ResourceKind::Stylesheet | ResourceKind::CompiledStylesheet | ResourceKind::Script => {
                match (&self.locator, &self.raw) {
                    (None, None) => return Err(LoadError::MissingContent(self.kind.clone())),
                    (Some(_), Some(_)) => return Err(LoadError::ConflictingContent(self.kind.clone())),
                    _ => {}
                }
            }
            ResourceKind::Fetch | ResourceKind::Data(_) => {
                if self.locator.is_none() {
                    return Err(LoadError::MissingContent(self.kind.clone()));
                }
                if self.raw.is_some() {
                    return Err(LoadError::ConflictingContent(self.kind.clone()));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Declaration")
            .field("kind", &self.kind)
            .field("locator", &self.locator)
            .field("raw", &self.raw.as_ref().map(|raw| raw.len()))
            .field("name", &self.name)
            .field("load_after", &self.load_after)
            .field("then", &self.then.is_some())
            .field("store_original_result", &self.store_original_result)
            .finish_non_exhaustive()
    }
}

/// The resolved resources of one component, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct LoadedResources {
    values: Vec<Resource>,
    lookup: HashMap<String, usize>,
}

impl LoadedResources {
    pub(crate) fn new(values: Vec<Resource>, lookup: HashMap<String, usize>) -> Self {
        Self { values, lookup }
    }

    pub fn get(&self, index: usize) -> Option<&Resource> {
        self.values.get(index)
    }

    pub fn get_named(&self, name: &str) -> Option<&Resource> {
        self.lookup.get(name).and_then(|&index| self.values.get(index))
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.lookup.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.values.iter()
    }

    /// Append a value, recording its name when it has one
    pub(crate) fn push(&mut self, name: Option<&str>, resource: Resource) -> usize {
        let index = self.values.len();
        if let Some(name) = name {
            self.lookup.insert(name.to_string(), index);
        }
        self.values.push(resource);
        index
    }

    pub(crate) fn replace(&mut self, index: usize, resource: Resource) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = resource;
        }
    }
}

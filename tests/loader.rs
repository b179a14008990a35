use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uki::resources::{
    Declaration, Document, FetchInit, FetchResponse, LoadError, MemoryNetwork, Network, NodeTag, Resource,
    ResourceCache, ResourceLoader, StylesheetCompiler,
};

fn loader(network: &MemoryNetwork) -> ResourceLoader {
    ResourceLoader::builder(Arc::new(network.clone()))
        .cache(ResourceCache::new())
        .build()
}

/// Network that records when each fetch starts and ends.
#[derive(Clone, Default)]
struct RecordingNetwork {
    log: Arc<Mutex<Vec<String>>>,
    delays: HashMap<String, Duration>,
}

impl RecordingNetwork {
    fn delay(mut self, locator: &str, delay: Duration) -> Self {
        self.delays.insert(locator.to_string(), delay);
        self
    }

    fn position(&self, entry: &str) -> usize {
        let log = self.log.lock().unwrap();
        log.iter()
            .position(|line| line == entry)
            .unwrap_or_else(|| panic!("'{}' missing from {:?}", entry, log))
    }
}

#[async_trait]
impl Network for RecordingNetwork {
    async fn fetch(&self, locator: &str, _init: &FetchInit) -> Result<FetchResponse, LoadError> {
        self.log.lock().unwrap().push(format!("start {}", locator));
        if let Some(delay) = self.delays.get(locator) {
            tokio::time::sleep(*delay).await;
        }
        self.log.lock().unwrap().push(format!("end {}", locator));
        Ok(FetchResponse::ok(locator, json!({ "from": locator }).to_string()))
    }
}

/// Compiler that wraps its source and records the arguments it was given.
#[derive(Default)]
struct WrappingCompiler {
    calls: Mutex<Vec<Map<String, Value>>>,
}

#[async_trait]
impl StylesheetCompiler for WrappingCompiler {
    fn script(&self) -> Option<String> {
        Some("less.js".to_string())
    }

    async fn compile(&self, source: &str, args: &Map<String, Value>) -> Result<String, LoadError> {
        self.calls.lock().unwrap().push(args.clone());
        if source.contains("@broken") {
            return Err(LoadError::Compile("unexpected token".to_string()));
        }
        Ok(format!(":root {{ --compiled: yes; }}\n{}", source.replace("@color", "red")))
    }
}

#[tokio::test(start_paused = true)]
async fn test_dependencies_settle_before_dependents_start() {
    let network = RecordingNetwork::default().delay("a.json", Duration::from_millis(50));
    let loader = ResourceLoader::builder(Arc::new(network.clone()))
        .cache(ResourceCache::new())
        .build();

    let resources = loader
        .load(vec![
            Declaration::json("a.json").named("a"),
            Declaration::json("b.json").named("b").load_after(["a"]),
            Declaration::json("c.json").named("c").load_after(["a"]),
        ])
        .await
        .unwrap();

    let a_done = network.position("end a.json");
    assert!(a_done < network.position("start b.json"));
    assert!(a_done < network.position("start c.json"));

    // Output follows declaration order, not completion order
    let sources: Vec<Value> = resources
        .iter()
        .map(|resource| resource.as_data().unwrap()["from"].clone())
        .collect();
    assert_eq!(sources, vec![json!("a.json"), json!("b.json"), json!("c.json")]);
    assert_eq!(resources.index_of("c"), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_unrelated_declarations_load_concurrently() {
    let network = RecordingNetwork::default()
        .delay("slow.json", Duration::from_millis(100))
        .delay("fast.json", Duration::from_millis(10));
    let loader = ResourceLoader::builder(Arc::new(network.clone()))
        .cache(ResourceCache::new())
        .build();

    loader
        .load(vec![Declaration::json("slow.json"), Declaration::json("fast.json")])
        .await
        .unwrap();

    assert!(network.position("start fast.json") < network.position("end slow.json"));
    assert!(network.position("end fast.json") < network.position("end slow.json"));
}

#[tokio::test]
async fn test_cycle_rejects_and_loads_nothing() {
    let network = MemoryNetwork::new();
    let result = loader(&network)
        .load(vec![
            Declaration::json("root.json").named("root"),
            Declaration::json("a.json").named("a").load_after(["b"]),
            Declaration::json("b.json").named("b").load_after(["a"]),
        ])
        .await;

    assert_eq!(result.unwrap_err(), LoadError::Cycle);
    assert_eq!(network.total_requests(), 0);
}

#[tokio::test]
async fn test_no_root_is_rejected() {
    let network = MemoryNetwork::new();
    let result = loader(&network)
        .load(vec![
            Declaration::json("a.json").named("a").load_after(["b"]),
            Declaration::json("b.json").named("b").load_after(["a"]),
        ])
        .await;
    assert_eq!(result.unwrap_err(), LoadError::NoRoot);
}

#[tokio::test]
async fn test_unknown_dependency_rejects_before_loading() {
    let network = MemoryNetwork::new().with("data.json", "[]");
    let result = loader(&network).start(vec![Declaration::json("data.json").load_after(["x"])]);

    assert!(matches!(result, Err(LoadError::UnknownDependency(ref name)) if name == "x"));
    assert_eq!(network.total_requests(), 0);
}

#[tokio::test]
async fn test_empty_declaration_list() {
    let resources = loader(&MemoryNetwork::new()).load(Vec::new()).await.unwrap();
    assert!(resources.is_empty());
}

#[tokio::test]
async fn test_same_locator_is_fetched_once() {
    let network = MemoryNetwork::new().with("theme.css", ":root { --accent: teal; }");
    let loader = loader(&network);

    let resources = loader
        .load(vec![Declaration::stylesheet("theme.css"), Declaration::stylesheet("theme.css")])
        .await
        .unwrap();

    assert_eq!(network.requests("theme.css"), 1);
    assert_eq!(resources.get(0), resources.get(1));
    assert_eq!(loader.document().count(NodeTag::Link), 1);

    let sheet = resources.get(0).unwrap().as_stylesheet().unwrap();
    assert_eq!(sheet.href.as_deref(), Some("theme.css"));
    assert_eq!(sheet.variables["--accent"], "teal");
}

#[tokio::test]
async fn test_identical_inline_css_is_inserted_once() {
    let network = MemoryNetwork::new();
    let loader = loader(&network);
    let css = "body { margin: 0; }";

    let resources = loader
        .load(vec![Declaration::raw_stylesheet(css), Declaration::raw_stylesheet(css)])
        .await
        .unwrap();

    assert_eq!(loader.document().count(NodeTag::Style), 1);
    assert_eq!(resources.get(0), resources.get(1));
    assert_eq!(network.total_requests(), 0);
}

#[tokio::test]
async fn test_cache_is_shared_between_loaders() {
    let network = MemoryNetwork::new().with("app.js", "console.log('hi')");
    let cache = ResourceCache::new();
    let first = ResourceLoader::builder(Arc::new(network.clone()))
        .cache(cache.clone())
        .build();
    let second = ResourceLoader::builder(Arc::new(network.clone()))
        .cache(cache.clone())
        .build();

    let a = first.load_one(Declaration::script("app.js")).await.unwrap();
    let b = second.load_one(Declaration::script("app.js")).await.unwrap();

    assert_eq!(a, b);
    assert_eq!(network.requests("app.js"), 1);
    assert_eq!(a.as_script().unwrap().text, "console.log('hi')");
}

#[tokio::test]
async fn test_existing_link_is_reused() {
    let network = MemoryNetwork::new().with("site.css", "p {}");
    let document = Document::new();
    let existing = document.insert(
        NodeTag::Link,
        [("href".to_string(), "site.css".to_string())].into(),
        ":root { --from-page: 1; }".to_string(),
        false,
    );
    let loader = ResourceLoader::builder(Arc::new(network.clone()))
        .document(document.clone())
        .cache(ResourceCache::new())
        .build();

    let resource = loader.load_one(Declaration::stylesheet("site.css")).await.unwrap();
    let sheet = resource.as_stylesheet().unwrap();

    assert_eq!(sheet.node, existing);
    assert_eq!(sheet.variables["--from-page"], "1");
    assert_eq!(network.requests("site.css"), 0);
    assert_eq!(document.count(NodeTag::Link), 1);
}

#[tokio::test]
async fn test_stylesheet_attributes_and_prepend() {
    let network = MemoryNetwork::new().with("print.css", "p {}");
    let loader = loader(&network);

    loader
        .load(vec![
            Declaration::raw_stylesheet("h1 {}"),
            Declaration::stylesheet("print.css").attribute("media", "print").prepend(),
        ])
        .await
        .unwrap();

    let nodes = loader.document().nodes();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].tag, NodeTag::Link);
    assert_eq!(nodes[0].attributes["media"], "print");
    assert_eq!(nodes[0].attributes["rel"], "stylesheet");
    assert_eq!(nodes[1].tag, NodeTag::Style);
}

#[tokio::test]
async fn test_failed_stylesheet_leaves_no_node() {
    let network = MemoryNetwork::new();
    let loader = loader(&network);

    let error = loader.load_one(Declaration::stylesheet("missing.css")).await.unwrap_err();
    assert!(matches!(error, LoadError::Network { .. }));
    assert_eq!(loader.document().count(NodeTag::Link), 0);
}

#[tokio::test]
async fn test_failure_reaches_dependents_and_aggregate() {
    let network = MemoryNetwork::new().with("ok.json", "{}");
    network.fail("broken.json", "connection reset");

    let result = loader(&network)
        .load(vec![
            Declaration::json("broken.json").named("broken"),
            Declaration::json("ok.json").load_after(["broken"]),
        ])
        .await;

    match result {
        Err(LoadError::Network { locator, message }) => {
            assert_eq!(locator, "broken.json");
            assert_eq!(message, "connection reset");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(network.requests("ok.json"), 0);
}

#[tokio::test]
async fn test_fetch_resolves_to_response_and_rejects_errors() {
    let network = MemoryNetwork::new();
    network.insert_status("api/items", 200, "[1, 2]");
    network.insert_status("api/private", 403, "nope");
    let loader = loader(&network);

    let resource = loader.load_one(Declaration::fetch("api/items")).await.unwrap();
    let response = resource.as_response().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.json().unwrap(), json!([1, 2]));

    let error = loader.load_one(Declaration::fetch("api/private")).await.unwrap_err();
    assert!(matches!(error, LoadError::Network { ref message, .. } if message.contains("403")));
}

#[tokio::test]
async fn test_csv_with_row_transform() {
    let network = MemoryNetwork::new().with("people.csv", "name,age\nalice,30\nbob,x\ncarol,41\n");

    let resource = loader(&network)
        .load_one(Declaration::csv("people.csv").row(|row| {
            let age: u64 = row.get("age")?.as_str()?.parse().ok()?;
            Some(json!({ "name": row["name"], "age": age }))
        }))
        .await
        .unwrap();

    assert_eq!(
        resource.as_data().unwrap(),
        &json!([{ "name": "alice", "age": 30 }, { "name": "carol", "age": 41 }])
    );
}

#[tokio::test]
async fn test_dsv_requires_delimiter() {
    let network = MemoryNetwork::new().with("table.txt", "a|b\n1|2\n");
    let loader = loader(&network);

    let error = loader
        .load_one(Declaration::data("dsv", "table.txt"))
        .await
        .unwrap_err();
    assert!(matches!(error, LoadError::Parse { .. }));

    let resource = loader
        .load_one(Declaration::data("dsv", "table.txt").delimiter('|'))
        .await
        .unwrap();
    assert_eq!(resource.as_data().unwrap(), &json!([{ "a": "1", "b": "2" }]));
}

#[tokio::test]
async fn test_text_and_invalid_json() {
    let network = MemoryNetwork::new().with("notes.txt", "hello").with("bad.json", "{");
    let loader = loader(&network);

    let text = loader.load_one(Declaration::data("text", "notes.txt")).await.unwrap();
    assert_eq!(text.as_data().unwrap(), &json!("hello"));

    let error = loader.load_one(Declaration::json("bad.json")).await.unwrap_err();
    assert!(matches!(error, LoadError::Parse { ref locator, .. } if locator == "bad.json"));
}

#[tokio::test]
async fn test_then_replaces_value() {
    let network = MemoryNetwork::new().with("count.json", "{\"count\": 2}");

    let resource = loader(&network)
        .load_one(Declaration::json("count.json").then(|resource| {
            let count = resource.as_data().and_then(|data| data["count"].as_u64()).unwrap_or(0);
            Ok(Resource::Data(json!(count * 10)))
        }))
        .await
        .unwrap();

    assert_eq!(resource.as_data().unwrap(), &json!(20));
}

#[tokio::test]
async fn test_store_original_result_keeps_value() {
    let network = MemoryNetwork::new().with("count.json", "{\"count\": 2}");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observer = seen.clone();

    let resource = loader(&network)
        .load_one(
            Declaration::json("count.json")
                .then(move |resource| {
                    observer.lock().unwrap().push(resource.clone());
                    Ok(Resource::Data(Value::Null))
                })
                .store_original_result(),
        )
        .await
        .unwrap();

    assert_eq!(resource.as_data().unwrap(), &json!({ "count": 2 }));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failure_rejects_while_unrelated_loads_are_pending() {
    let network = RecordingNetwork::default().delay("slow.json", Duration::from_secs(3600));
    let loader = ResourceLoader::builder(Arc::new(network.clone()))
        .cache(ResourceCache::new())
        .build();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        loader.load(vec![
            Declaration::json("slow.json"),
            Declaration::json("bad.json")
                .named("bad")
                .then(|_| anyhow::bail!("rejected")),
        ]),
    )
    .await
    .expect("load should fail before the slow declaration settles");

    assert!(matches!(result, Err(LoadError::PostProcess { .. })));
    assert!(network.log.lock().unwrap().iter().all(|line| line != "end slow.json"));
}

#[tokio::test]
async fn test_failing_then_is_a_load_failure() {
    let network = MemoryNetwork::new().with("count.json", "{}");

    let error = loader(&network)
        .load_one(
            Declaration::json("count.json")
                .named("count")
                .then(|_| anyhow::bail!("missing field")),
        )
        .await
        .unwrap_err();

    assert_eq!(
        error,
        LoadError::PostProcess {
            resource: "count".to_string(),
            message: "missing field".to_string()
        }
    );
}

#[tokio::test]
async fn test_dependent_sees_post_processed_parent() {
    let network = RecordingNetwork::default();
    let order = Arc::new(Mutex::new(Vec::new()));
    let (parent_order, child_order) = (order.clone(), order.clone());
    let loader = ResourceLoader::builder(Arc::new(network))
        .cache(ResourceCache::new())
        .build();

    loader
        .load(vec![
            Declaration::json("b.json").named("b").load_after(["a"]).then(move |resource| {
                child_order.lock().unwrap().push("b");
                Ok(resource)
            }),
            Declaration::json("a.json").named("a").then(move |resource| {
                parent_order.lock().unwrap().push("a");
                Ok(resource)
            }),
        ])
        .await
        .unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
}

#[tokio::test]
async fn test_provided_value() {
    let network = MemoryNetwork::new();
    let resources = loader(&network)
        .load(vec![Declaration::provided(Resource::Data(json!({ "ready": true }))).named("flags")])
        .await
        .unwrap();

    assert_eq!(resources.get_named("flags").unwrap().as_data().unwrap()["ready"], json!(true));
    assert!(matches!(
        loader(&network).start(vec![Declaration::new(uki::ResourceKind::Provided)]),
        Err(LoadError::MissingContent(_))
    ));
}

#[tokio::test]
async fn test_content_requirements() {
    let loader = loader(&MemoryNetwork::new());

    assert!(matches!(
        loader.start(vec![Declaration::new(uki::ResourceKind::Stylesheet)]),
        Err(LoadError::MissingContent(_))
    ));
    assert!(matches!(
        loader.start(vec![Declaration::stylesheet("a.css").with_raw("p {}")]),
        Err(LoadError::ConflictingContent(_))
    ));
    assert!(matches!(
        loader.start(vec![Declaration::data("xml", "feed.xml")]),
        Err(LoadError::UnsupportedKind(ref kind)) if kind == "xml"
    ));
    assert!(matches!(
        loader.start(vec![Declaration::compiled_stylesheet("theme.less")]),
        Err(LoadError::NoCompiler)
    ));
}

#[tokio::test]
async fn test_compiled_stylesheets_share_one_compiler_script() {
    let network = MemoryNetwork::new()
        .with("less.js", "/* compiler */")
        .with("theme.less", "a { color: @color; }");
    let compiler = Arc::new(WrappingCompiler::default());
    let mut args = Map::new();
    args.insert("strictMath".to_string(), json!(true));

    let loader = ResourceLoader::builder(Arc::new(network.clone()))
        .cache(ResourceCache::new())
        .compiler(compiler.clone())
        .build();

    let resources = loader
        .load(vec![
            Declaration::compiled_stylesheet("theme.less").compile_args(args.clone()),
            Declaration::raw_compiled_stylesheet("b { color: @color; }"),
        ])
        .await
        .unwrap();

    assert_eq!(network.requests("less.js"), 1);
    assert_eq!(loader.document().count(NodeTag::Script), 1);
    assert_eq!(loader.document().count(NodeTag::Style), 2);

    let sheet = resources.get(0).unwrap().as_stylesheet().unwrap();
    assert!(sheet.text.contains("a { color: red; }"));
    assert_eq!(sheet.variables["--compiled"], "yes");
    let calls = compiler.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert!(calls.contains(&args));
}

#[tokio::test]
async fn test_compile_error_is_reported() {
    let network = MemoryNetwork::new().with("less.js", "");
    let loader = ResourceLoader::builder(Arc::new(network))
        .cache(ResourceCache::new())
        .compiler(Arc::new(WrappingCompiler::default()))
        .build();

    let error = loader
        .load_one(Declaration::raw_compiled_stylesheet("@broken {"))
        .await
        .unwrap_err();
    assert_eq!(error, LoadError::Compile("unexpected token".to_string()));
}

#[tokio::test]
async fn test_identical_raw_scripts_are_inserted_once() {
    let loader = loader(&MemoryNetwork::new());
    let resources = loader
        .load(vec![
            Declaration::raw_script("window.x = 1;").attribute("defer", "true"),
            Declaration::raw_script("window.x = 1;").attribute("defer", "true"),
        ])
        .await
        .unwrap();

    assert_eq!(loader.document().count(NodeTag::Script), 1);
    assert_eq!(resources.get(0), resources.get(1));
    let node = &loader.document().nodes()[0];
    assert_eq!(node.attributes["type"], "application/javascript");
    assert_eq!(node.attributes["defer"], "true");
}

#[test]
fn test_declarations_deserialize_from_manifest_json() {
    let declarations: Vec<Declaration> = serde_json::from_value(json!([
        { "type": "css", "url": "theme.css", "unshift": true },
        { "type": "json", "url": "data.json", "name": "data" },
        { "type": "dsv", "url": "table.txt", "delimiter": "|", "loadAfter": ["data"] },
        { "type": "js", "raw": "window.x = 1;", "extraAttributes": { "defer": "true" } },
        { "type": "network-fetch", "url": "https://example.com/status" }
    ]))
    .unwrap();

    assert_eq!(declarations.len(), 5);
    assert_eq!(declarations[0].kind, uki::ResourceKind::Stylesheet);
    assert!(declarations[0].prepend);
    assert_eq!(declarations[1].name.as_deref(), Some("data"));
    assert_eq!(declarations[2].delimiter, Some('|'));
    assert_eq!(declarations[2].load_after, vec!["data"]);
    assert_eq!(declarations[3].kind, uki::ResourceKind::Script);
    assert_eq!(declarations[3].extra_attributes["defer"], "true");
    assert_eq!(declarations[4].kind, uki::ResourceKind::Fetch);
}

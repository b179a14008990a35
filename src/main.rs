use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uki::config::Config;
use uki::resources::{Declaration, HttpNetwork, ResourceLoader};

/// A manifest is either a bare list of declarations or `{ "resources": [...] }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Manifest {
    List(Vec<Declaration>),
    Wrapped { resources: Vec<Declaration> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Some(argument) = std::env::args().nth(1) else {
        eprintln!("Usage: uki <manifest.json>");
        eprintln!("       uki --generate-config");
        eprintln!("\nLoads every resource declared in the manifest, in load_after order,");
        eprintln!("and prints one line per resolved resource.");
        std::process::exit(2);
    };

    if argument == "--generate-config" {
        return Config::generate_default_config(Config::get_default_config_path()?);
    }

    let config = Config::load()?;
    uki::logger::init(&config.logging)?;

    let manifest_path = PathBuf::from(&argument);
    let content = tokio::fs::read_to_string(&manifest_path)
        .await
        .with_context(|| format!("Failed to read manifest: {}", manifest_path.display()))?;
    let declarations = parse_manifest(&content, manifest_path.parent())
        .with_context(|| format!("Failed to parse manifest: {}", manifest_path.display()))?;

    let labels: Vec<String> = declarations.iter().map(Declaration::label).collect();
    let network = Arc::new(HttpNetwork::new(&config.loader.user_agent)?);
    let loader = ResourceLoader::from_config(&config.loader, network);
    let resources = loader.load(declarations).await.context("Failed to load resources")?;

    for (label, resource) in labels.iter().zip(resources.iter()) {
        println!("{:<40} {}", label, resource.summary());
    }

    Ok(())
}

/// Parse the manifest, resolving relative file locators against `base`.
fn parse_manifest(content: &str, base: Option<&Path>) -> Result<Vec<Declaration>> {
    let manifest: Manifest = serde_json::from_str(content)?;
    let mut declarations = match manifest {
        Manifest::List(declarations) => declarations,
        Manifest::Wrapped { resources } => resources,
    };

    if let Some(base) = base {
        for declaration in &mut declarations {
            if let Some(locator) = &declaration.locator {
                let is_remote = locator.contains("://");
                if !is_remote && Path::new(locator).is_relative() {
                    declaration.locator = Some(base.join(locator).to_string_lossy().into_owned());
                }
            }
        }
    }

    Ok(declarations)
}

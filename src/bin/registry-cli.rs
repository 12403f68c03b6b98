use std::collections::BTreeMap;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use serde_json::{json, Value};

use service_registry::config::StoreConfig;
use service_registry::pool::{announce, withdraw};
use service_registry::registry::ServiceFilter;
use service_registry::store::{CoordinationStore, EtcdStore, Node};

#[derive(Parser)]
#[command(name = "registry-cli")]
#[command(about = "Inspect and edit the service registry in etcd", long_about = None)]
struct Cli {
    /// etcd endpoints, `;`-separated
    #[arg(short, long, env = "ETCD_HOST", default_value = "http://127.0.0.1:2379")]
    endpoints: String,

    /// Registry root directory
    #[arg(short, long, env = "REGISTRY_ROOT", default_value = "/backends")]
    root: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every service and its instances
    List,
    /// Publish an instance address
    Announce {
        service: String,
        instance_id: String,
        address: String,
    },
    /// Remove an instance
    Withdraw { service: String, instance_id: String },
    /// Stream registry changes until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = StoreConfig {
        endpoints: cli
            .endpoints
            .split(';')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(String::from)
            .collect(),
        root: cli.root.clone(),
        ..StoreConfig::default()
    };
    let store = EtcdStore::new(&config)?;
    let filter = ServiceFilter::new(cli.root.clone());

    match cli.command {
        Commands::List => {
            let tree = match store.get(filter.root(), true).await {
                Ok(response) => listing(&response.node),
                Err(e) if e.is_not_found() => json!({}),
                Err(e) => return Err(e.into()),
            };
            println!("{}", serde_json::to_string_pretty(&tree)?);
        }
        Commands::Announce {
            service,
            instance_id,
            address,
        } => {
            let key = filter.instance_key(&service, &instance_id)?;
            let outcome = announce(&store, &key, &address).await?;
            let out = json!({ "key": key, "address": address, "outcome": format!("{outcome:?}") });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Withdraw {
            service,
            instance_id,
        } => {
            let key = filter.instance_key(&service, &instance_id)?;
            let removed = withdraw(&store, &key).await?;
            println!("{}", serde_json::to_string_pretty(&json!({ "key": key, "removed": removed }))?);
        }
        Commands::Watch => {
            let mut events = store.watch(filter.root(), true, None);
            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(Ok(event)) => {
                            let out = json!({
                                "action": event.action.as_str(),
                                "key": event.key,
                                "value": event.value,
                                "dir": event.dir,
                                "index": event.index,
                            });
                            println!("{}", serde_json::to_string_pretty(&out)?);
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }

    Ok(())
}

/// `{ service: { instance_id: address } }`; stray leaves are listed under `_malformed`.
fn listing(root: &Node) -> Value {
    let mut services: BTreeMap<String, Value> = BTreeMap::new();
    for service in &root.nodes {
        let name = last_segment(&service.key);
        if service.dir {
            let instances: BTreeMap<&str, Option<&str>> = service
                .nodes
                .iter()
                .map(|i| (last_segment(&i.key), i.value.as_deref()))
                .collect();
            services.insert(name.to_string(), json!(instances));
        } else {
            let malformed = services
                .entry("_malformed".to_string())
                .or_insert_with(|| json!({}));
            if let Some(entries) = malformed.as_object_mut() {
                entries.insert(name.to_string(), json!(service.value));
            }
        }
    }
    json!(services)
}

fn last_segment(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

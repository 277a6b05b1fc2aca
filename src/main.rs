use clap::Parser;
use kubemirror::Result;
use kubemirror::k8s::remote::{
    KubeRemote, api_resource_for, namespace_key, object_key, type_normalizer,
};
use kubemirror::k8s::{USER_AGENT, client};
use kubemirror::mirror::{IndexedCache, PRIMARY_INDEX, ResourceWatcher, WatcherRegistry};
use kube::api::DynamicObject;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace to mirror (all namespaces when omitted)
    #[arg(short, long)]
    namespace: Option<String>,

    /// Resource kinds to mirror
    #[arg(short, long, default_values_t = ["Pod".to_string(), "ReplicaSet".to_string(), "Event".to_string()])]
    kinds: Vec<String>,

    /// Watch resync interval in seconds (jittered per watcher)
    #[arg(short, long, default_value_t = 300)]
    resync_seconds: u64,

    /// Seconds between cache stats reports
    #[arg(short, long, default_value_t = 60)]
    stats_seconds: u64,
}

/// Resource versions differ whenever the server accepted any change; using
/// them for change detection avoids deep-comparing whole objects.
fn resource_version_changed(incoming: &DynamicObject, current: &mut DynamicObject) -> bool {
    if current.metadata.resource_version == incoming.metadata.resource_version {
        false
    } else {
        *current = incoming.clone();
        true
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Initialize crypto provider for rustls
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let args = Args::parse();
    let client = client::new(Some(USER_AGENT)).await?;

    let cache = Arc::new(
        IndexedCache::builder()
            .index(PRIMARY_INDEX, object_key)
            .index("by-namespace", namespace_key)
            .build()?,
    );
    let registry = WatcherRegistry::new();

    for kind in &args.kinds {
        let Some(resource) = api_resource_for(kind) else {
            warn!("⚠️  {kind} is not a supported kind, skipping");
            continue;
        };

        let remote = match &args.namespace {
            Some(ns) => KubeRemote::namespaced(client.clone(), ns, &resource),
            None => KubeRemote::all(client.clone(), &resource),
        };

        let cache = cache.clone();
        let resync = Duration::from_secs(args.resync_seconds);
        registry
            .get_or_start(kind, move || {
                Ok(ResourceWatcher::<DynamicObject, DynamicObject>::builder(&resource.kind, cache)
                    .client(Arc::new(remote))
                    .resync_interval(resync)
                    .create_fn(DynamicObject::clone)
                    .update_fn(resource_version_changed)
                    .normalize_fn(type_normalizer(&resource))
                    .build()?
                    .start())
            })
            .await?;
    }

    if registry.kinds().await.is_empty() {
        error!("❌ no watchable kinds configured");
        return Err(kubemirror::Error::custom("no watchable kinds configured"));
    }

    registry.await_ready().await;
    info!("✅ all watchers ready");

    let mut stats_interval = tokio::time::interval(Duration::from_secs(args.stats_seconds));
    stats_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 interrupt received, shutting down");
                break;
            }
            _ = stats_interval.tick() => {
                let stats = cache.stats().await;
                let restarts = registry.restart_counts().await;
                info!(
                    "💾 mirroring {} objects, restarts: {restarts:?}",
                    stats.total_objects
                );
            }
        }
    }

    registry.shutdown().await;
    Ok(())
}

use std::sync::Arc;

use kube_lifecycle::discovery::DiscoveryReconciler;
use kube_lifecycle::probes::ec2::Ec2Instances;
use kube_lifecycle::probes::kube::KubeTopology;
use kube_lifecycle::store::{DynamoStore, Store};

use crate::commands::{connect, load_settings};

pub async fn run(config_path: &str) -> anyhow::Result<()> {
    println!("Running discovery scan...\n");

    let settings = load_settings(config_path)?;
    let clients = connect(&settings).await?;

    print!("  Cluster connection .......... ");
    match clients.kube.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}", e);
        }
    }

    let store: Arc<dyn Store> = Arc::new(DynamoStore::new(
        clients.dynamo.clone(),
        settings.store.table_name.clone(),
    ));
    let topology = Arc::new(KubeTopology::new(clients.kube.clone()));
    let instances = Arc::new(Ec2Instances::new(clients.ec2.clone()));

    let reconciler = DiscoveryReconciler::new(store, topology, instances, settings);
    let summary = reconciler.run_scan().await?;

    println!("  Apps discovered ............. {}", summary.apps_seen);
    println!("  Records written ............. {}", summary.apps_written);
    println!("  Shared databases ............ {}", summary.shared_databases);

    if summary.failures.is_empty() {
        println!("\nScan completed cleanly.");
    } else {
        println!("\n  Failures:");
        for (app, error) in &summary.failures {
            println!("    {app}: {error}");
        }
        println!("\nScan completed with {} failure(s).", summary.failures.len());
    }

    Ok(())
}

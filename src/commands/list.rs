use chrono::{DateTime, Utc};

use kube_lifecycle::model::{APP_PREFIX, ApplicationRecord};
use kube_lifecycle::store::{DynamoStore, Store};

use crate::commands::{connect, load_settings};

pub async fn run(config_path: &str) -> anyhow::Result<()> {
    let settings = load_settings(config_path)?;
    let clients = connect(&settings).await?;
    let store = DynamoStore::new(clients.dynamo, settings.store.table_name.clone());

    let items = store.scan_prefix(APP_PREFIX).await?;

    let mut rows: Vec<(String, String, String, String, String)> = items
        .into_iter()
        .filter_map(|(_, doc)| serde_json::from_value::<ApplicationRecord>(doc).ok())
        .map(|r| {
            let pool = r
                .node_pool
                .as_ref()
                .map(|p| p.name.clone())
                .unwrap_or_else(|| "-".to_string());
            let dbs = match (&r.databases.postgres, &r.databases.neo4j) {
                (Some(_), Some(_)) => "postgres+neo4j",
                (Some(_), None) => "postgres",
                (None, Some(_)) => "neo4j",
                (None, None) => "-",
            }
            .to_string();
            let discovered = DateTime::<Utc>::from_timestamp(r.last_discovered_at, 0)
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string());
            (r.app_name, r.namespace, pool, dbs, discovered)
        })
        .collect();

    rows.sort_by(|a, b| a.0.cmp(&b.0));

    println!(
        "{:<40} {:<20} {:<16} {:<16} {:<17}",
        "APP", "NAMESPACE", "NODE POOL", "DATABASES", "DISCOVERED"
    );
    println!("{}", "-".repeat(111));

    for (app, ns, pool, dbs, discovered) in &rows {
        println!("{:<40} {:<20} {:<16} {:<16} {:<17}", app, ns, pool, dbs, discovered);
    }

    println!("\nTotal: {} applications", rows.len());

    Ok(())
}

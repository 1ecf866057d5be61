use kube_lifecycle::probes::eks::EksNodePools;
use kube_lifecycle::probes::{NodePoolProbe, NodePoolStatus};

use crate::commands::{connect, load_settings};

pub async fn run(config_path: &str) -> anyhow::Result<()> {
    println!("Running connectivity checks...\n");

    let settings = load_settings(config_path)?;

    // 1. Kubernetes client from kubeconfig
    print!("  Kubeconfig .................. ");
    let clients = match connect(&settings).await {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot build clients: {}", e);
        }
    };

    // 2. Actual cluster connectivity
    print!("  Cluster connection .......... ");
    match clients.kube.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {}", e);
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    }

    // 3. Registry table
    print!("  Registry table .............. ");
    match clients
        .dynamo
        .describe_table()
        .table_name(&settings.store.table_name)
        .send()
        .await
    {
        Ok(_) => println!("OK ({})", settings.store.table_name),
        Err(e) => println!("FAIL ({})", e.into_service_error()),
    }

    // 4. EC2 describe permission
    print!("  EC2 describe permission ..... ");
    match clients.ec2.describe_instances().max_results(5).send().await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({})", e.into_service_error()),
    }

    // 5. EKS cluster and configured node pools
    print!("  EKS cluster ................. ");
    match clients
        .eks
        .describe_cluster()
        .name(&settings.cluster.name)
        .send()
        .await
    {
        Ok(out) => println!(
            "OK ({})",
            out.cluster()
                .and_then(|c| c.status())
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string())
        ),
        Err(e) => println!("FAIL ({})", e.into_service_error()),
    }

    let pools = EksNodePools::new(
        clients.eks.clone(),
        clients.kube.clone(),
        settings.cluster.name.clone(),
    );
    for defaults in settings.node_pool_defaults.values().flatten() {
        print!("  Node pool {:<16} ", format!("{} ...", defaults.name));
        match pools.describe(&defaults.name).await {
            Ok(view) if view.status == NodePoolStatus::NotFound => println!("MISSING"),
            Ok(view) => println!("OK ({:?}, {} nodes)", view.status, view.current_nodes),
            Err(e) => println!("FAIL ({})", e),
        }
    }

    println!("\nAll checks completed.");
    Ok(())
}

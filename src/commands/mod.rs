pub mod check;
pub mod discover;
pub mod list;
pub mod serve;

use anyhow::{Context, Result};
use aws_config::{BehaviorVersion, Region};

use kube_lifecycle::config::Settings;

/// SDK handles shared by every subcommand. Built once, cloned into the
/// components that need them.
pub(crate) struct Clients {
    pub kube: kube::Client,
    pub ec2: aws_sdk_ec2::Client,
    pub eks: aws_sdk_eks::Client,
    pub dynamo: aws_sdk_dynamodb::Client,
}

pub(crate) fn load_settings(path: &str) -> Result<Settings> {
    if std::path::Path::new(path).exists() {
        Settings::load(path)
    } else {
        println!("  Config ...................... {path} not found, using defaults");
        Ok(Settings::default())
    }
}

pub(crate) async fn connect(settings: &Settings) -> Result<Clients> {
    let kube = kube::Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    let aws = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(settings.aws.region.clone()))
        .load()
        .await;

    Ok(Clients {
        kube,
        ec2: aws_sdk_ec2::Client::new(&aws),
        eks: aws_sdk_eks::Client::new(&aws),
        dynamo: aws_sdk_dynamodb::Client::new(&aws),
    })
}

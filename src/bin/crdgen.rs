//! Prints the `ClusterRequest` CustomResourceDefinition as YAML.

use k8s_provisioner::crd::ClusterRequest;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&ClusterRequest::crd())?);
    Ok(())
}

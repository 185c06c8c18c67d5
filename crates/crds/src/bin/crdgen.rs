//! Prints the CustomResourceDefinition manifests as YAML.
//!
//! ```text
//! cargo run -p crds --bin crdgen > deploy/crds.yaml
//! ```

use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&crds::FloatingIP::crd())?);
    Ok(())
}

//! Prints the homesec CRD manifests as a multi-document YAML stream.
//!
//! Usage: `cargo run -p crds --bin crdgen > deploy/crds.yaml`

use crds::{Camera, Capabilities, TemperatureSensor};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [Capabilities::crd(), Camera::crd(), TemperatureSensor::crd()];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}

//! Work done once before the controllers start

mod crds;

pub use crds::{crd_manifests, ensure_crds_installed};

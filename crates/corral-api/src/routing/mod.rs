//! Request path conventions

mod path;

pub use path::{cluster_from_path, strip_cluster_prefix, CLUSTER_PATH_PREFIX};

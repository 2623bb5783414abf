//! Every workspace member inherits its version from the root manifest.

use std::path::{Path, PathBuf};

const MEMBERS: [&str; 4] = [
    "crates/planweave-core",
    "crates/planweave-cli",
    "crates/scenario-state",
    "crates/state-merge",
];

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .unwrap()
        .to_path_buf()
}

fn manifest(dir: &Path) -> toml::Value {
    let text = std::fs::read_to_string(dir.join("Cargo.toml")).unwrap();
    text.parse().unwrap()
}

#[test]
fn members_inherit_workspace_version() {
    let root = workspace_root();
    for member in MEMBERS {
        let doc = manifest(&root.join(member));
        let inherited = doc["package"]["version"]
            .get("workspace")
            .and_then(|v| v.as_bool());
        assert_eq!(inherited, Some(true), "{member} must use version.workspace = true");
    }
}

#[test]
fn root_lists_every_member() {
    let doc = manifest(&workspace_root());
    let members: Vec<&str> = doc["workspace"]["members"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m.as_str())
        .collect();
    for member in MEMBERS {
        assert!(members.contains(&member), "{member} missing from workspace members");
    }
}

#[test]
fn workspace_version_matches_cargo_pkg() {
    let doc = manifest(&workspace_root());
    let version = doc["workspace"]["package"]["version"].as_str().unwrap();
    assert_eq!(version, env!("CARGO_PKG_VERSION"));
}

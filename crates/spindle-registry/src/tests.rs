use super::*;
use spindle_core::DeclarationStore;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[test]
fn search_names_filters_and_sorts() {
    let root = test_registry_root();
    write_package(&root, "zlib", &simple_declaration("zlib", &[]));
    write_package(&root, "zlib-ng", &simple_declaration("zlib-ng", &[]));
    write_package(&root, "bzip2", &simple_declaration("bzip2", &[]));
    fs::create_dir_all(root.join("packages").join("empty")).expect("must create empty dir");

    let index = RegistryIndex::open(&root);
    assert_eq!(
        index.search_names("zlib").expect("must search"),
        vec!["zlib", "zlib-ng"]
    );
    assert_eq!(
        index.search_names("").expect("must search"),
        vec!["bzip2", "zlib", "zlib-ng"]
    );

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn missing_registry_is_empty() {
    let root = test_registry_root();
    let index = RegistryIndex::open(&root);
    assert!(index.search_names("").expect("must search").is_empty());
    assert!(index
        .package_declaration("zlib")
        .expect("must look up")
        .is_none());
    let catalog = index.load_catalog().expect("must load empty catalog");
    assert!(catalog.is_empty());
}

#[test]
fn package_declaration_rejects_mismatched_directory() {
    let root = test_registry_root();
    write_package(&root, "zlib", &simple_declaration("bzip2", &[]));

    let err = RegistryIndex::open(&root)
        .package_declaration("zlib")
        .expect_err("must reject mismatched name");
    assert!(err.to_string().contains("lives in directory"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn package_declaration_reports_parse_errors_with_path() {
    let root = test_registry_root();
    write_package(&root, "zlib", "name = \"zlib\"\nversions = 3\n");

    let err = RegistryIndex::open(&root)
        .package_declaration("zlib")
        .expect_err("must reject bad toml");
    assert!(err.to_string().contains("failed parsing package declaration"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn load_catalog_reads_providers_and_virtuals() {
    let root = test_registry_root();
    write_package(&root, "openmpi", &simple_declaration("openmpi", &["mpi"]));
    write_package(&root, "mpich", &simple_declaration("mpich", &["mpi"]));
    fs::write(
        root.join("providers.toml"),
        "[providers]\nmpi = [\"openmpi\", \"mpich\"]\n",
    )
    .expect("must write providers");

    let catalog = RegistryIndex::open(&root)
        .load_catalog()
        .expect("must load catalog");
    assert_eq!(catalog.len(), 2);
    assert!(catalog.is_virtual("mpi"));
    assert_eq!(catalog.default_providers("mpi"), vec!["openmpi", "mpich"]);
    assert_eq!(catalog.providers("mpi").len(), 2);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn stack_prefers_earlier_repositories() {
    let site = test_registry_root();
    let builtin = test_registry_root();
    write_package(
        &site,
        "zlib",
        "name = \"zlib\"\nversions = [{ version = \"1.3.1\" }]\n",
    );
    write_package(&builtin, "zlib", &simple_declaration("zlib", &[]));
    write_package(&builtin, "bzip2", &simple_declaration("bzip2", &[]));
    fs::write(
        site.join("providers.toml"),
        "[providers]\nmpi = [\"mpich\"]\n",
    )
    .expect("must write providers");
    fs::write(
        builtin.join("providers.toml"),
        "[providers]\nmpi = [\"openmpi\"]\nblas = [\"openblas\"]\n",
    )
    .expect("must write providers");

    let stack = RegistryStack::open([site.clone(), builtin.clone()]);
    let catalog = stack.load_catalog().expect("must load catalog");
    let zlib = catalog.get_declaration("zlib").expect("zlib declared");
    assert_eq!(zlib.versions[0].version.as_str(), "1.3.1");
    assert!(catalog.get_declaration("bzip2").is_some());
    assert_eq!(catalog.default_providers("mpi"), vec!["mpich"]);
    assert_eq!(catalog.default_providers("blas"), vec!["openblas"]);
    assert_eq!(
        stack.search_names("").expect("must search"),
        vec!["bzip2", "zlib"]
    );

    let _ = fs::remove_dir_all(&site);
    let _ = fs::remove_dir_all(&builtin);
}

#[test]
fn providers_file_rejects_empty_and_self_lists() {
    ProvidersFile::from_toml_str("[providers]\nmpi = []\n").expect_err("must reject empty list");
    ProvidersFile::from_toml_str("[providers]\nmpi = [\"mpi\"]\n")
        .expect_err("must reject self provider");
    let parsed = ProvidersFile::from_toml_str("").expect("empty file is valid");
    assert!(parsed.providers.is_empty());
}

fn simple_declaration(name: &str, provides: &[&str]) -> String {
    let provides = provides
        .iter()
        .map(|virtual_name| format!("{{ spec = \"{virtual_name}\" }}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "name = \"{name}\"\nversions = [{{ version = \"1.0\" }}, {{ version = \"2.0\" }}]\nprovides = [{provides}]\n"
    )
}

fn write_package(root: &Path, name: &str, content: &str) {
    let dir = root.join("packages").join(name);
    fs::create_dir_all(&dir).expect("must create package dir");
    fs::write(dir.join("package.toml"), content).expect("must write declaration");
}

static TEST_REGISTRY_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_registry_root() -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let counter = TEST_REGISTRY_ROOT_COUNTER.fetch_add(1, Ordering::SeqCst);
    path.push(format!(
        "spindle-registry-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        counter
    ));
    path
}

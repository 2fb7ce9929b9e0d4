use super::*;
use std::sync::Arc;

fn version(text: &str) -> Version {
    Version::parse(text).expect("version should parse")
}

fn concrete(name: &str, at: &str, children: Vec<(Spec, DependencyTypes)>) -> Spec {
    let mut spec = Spec::new(name);
    spec.version = VersionConstraint::exact(version(at));
    spec.compiler = Some(CompilerSpec::parse("gcc@=12.2.0").expect("compiler should parse"));
    spec.architecture = Some("linux-x86_64".to_string());
    spec.dependencies = children
        .into_iter()
        .map(|(spec, types)| DependencySpec::new(spec, types))
        .collect();
    spec.finalize().expect("spec should finalize")
}

fn run_only() -> DependencyTypes {
    DependencyTypes::new([DependencyType::Run])
}

#[test]
fn version_ordering_handles_prereleases_and_branches() {
    let ordered = ["1.2rc1", "1.2", "1.2.1", "1.10", "2.0", "develop"];
    for pair in ordered.windows(2) {
        assert!(
            version(pair[0]) < version(pair[1]),
            "expected {} < {}",
            pair[0],
            pair[1]
        );
    }
    assert_eq!(version("1.2"), version("1_2"));
    assert!(version("develop").is_infinity());
    assert!(!version("1.0").is_infinity());
}

#[test]
fn branch_versions_rank_develop_highest() {
    let ordered = ["99.0", "trunk", "head", "master", "main", "develop"];
    for pair in ordered.windows(2) {
        assert!(
            version(pair[0]) < version(pair[1]),
            "expected {} < {}",
            pair[0],
            pair[1]
        );
    }
    assert_eq!(version("develop").cmp(&version("develop")), std::cmp::Ordering::Equal);
}

#[test]
fn compiler_specs_can_key_hash_sets() {
    let set = ["gcc@12.2.0", "gcc@12.2.0", "clang@16:"]
        .iter()
        .map(|text| CompilerSpec::parse(text).expect("compiler should parse"))
        .collect::<std::collections::HashSet<_>>();
    assert_eq!(set.len(), 2);
}

#[test]
fn version_parse_rejects_garbage() {
    Version::parse("").expect_err("empty version must fail");
    Version::parse("1.2+build").expect_err("plus sign is not a version character");
}

#[test]
fn prefix_constraint_matches_only_whole_segments() {
    let constraint = VersionConstraint::parse("1.2").expect("constraint should parse");
    assert!(constraint.matches(&version("1.2")));
    assert!(constraint.matches(&version("1.2.5")));
    assert!(!constraint.matches(&version("1.20")));
    assert!(!constraint.matches(&version("1.3")));
}

#[test]
fn range_constraint_upper_bound_includes_prefixed_versions() {
    let closed = VersionConstraint::parse("1.2:1.4").expect("range should parse");
    assert!(closed.matches(&version("1.2")));
    assert!(closed.matches(&version("1.4.3")));
    assert!(!closed.matches(&version("1.5")));
    assert!(!closed.matches(&version("1.1.9")));

    let open = VersionConstraint::parse("1.2:").expect("open range should parse");
    assert!(open.matches(&version("7.0")));
    assert!(!open.matches(&version("1.1")));

    VersionConstraint::parse("2.0:1.0").expect_err("inverted range must fail");
}

#[test]
fn set_and_intersection_constraints() {
    let set = VersionConstraint::parse("1.2,1.4:").expect("set should parse");
    assert!(set.matches(&version("1.2.3")));
    assert!(set.matches(&version("1.6")));
    assert!(!set.matches(&version("1.3")));

    let narrowed = set.intersect(&VersionConstraint::parse(":1.5").expect("range should parse"));
    assert!(narrowed.matches(&version("1.4.1")));
    assert!(!narrowed.matches(&version("1.6")));
    assert_eq!(narrowed.to_string(), "1.2,1.4:@:1.5");
}

#[test]
fn exact_constraint_pins_one_version() {
    let exact = VersionConstraint::parse("=1.2").expect("exact should parse");
    assert_eq!(exact.exact_version(), Some(&version("1.2")));
    assert!(!exact.matches(&version("1.2.1")));
    assert_eq!(exact.to_string(), "=1.2");
}

#[test]
fn parse_full_spec() {
    let spec = Spec::parse(
        "hdf5@1.10: +mpi ~shared build_type=Release %gcc@12 arch=linux-x86_64 ^openmpi@4",
    )
    .expect("spec should parse");

    assert_eq!(spec.name, "hdf5");
    assert_eq!(spec.version.to_string(), "1.10:");
    assert_eq!(spec.compiler.as_ref().map(|c| c.name.as_str()), Some("gcc"));
    assert_eq!(spec.architecture.as_deref(), Some("linux-x86_64"));
    assert_eq!(spec.variants.get("mpi"), Some(&VariantValue::Bool(true)));
    assert_eq!(spec.variants.get("shared"), Some(&VariantValue::Bool(false)));
    assert_eq!(
        spec.variants.get("build_type"),
        Some(&VariantValue::Single("Release".to_string()))
    );
    assert_eq!(spec.dependencies.len(), 1);
    assert_eq!(spec.dependencies[0].spec.name, "openmpi");
    assert!(spec.dependencies[0].types.is_empty());
    assert!(!spec.is_concrete());
}

#[test]
fn parsed_spec_display_parses_back_to_the_same_spec() {
    let spec = Spec::parse("hdf5@1.10: +mpi ~shared build_type=Release %gcc@12 ^zlib@1.2")
        .expect("spec should parse");
    let rendered = spec.to_string();
    assert_eq!(rendered, "hdf5@1.10:%gcc@12+mpi~shared build_type=Release ^zlib@1.2");
    assert_eq!(Spec::parse(&rendered).expect("rendered spec should parse"), spec);
}

#[test]
fn parse_specs_splits_on_bare_names() {
    let specs = parse_specs("zlib@1.2 bzip2 +debug -shared").expect("specs should parse");
    assert_eq!(specs.len(), 2);
    assert_eq!(specs[0].name, "zlib");
    assert_eq!(specs[1].name, "bzip2");
    assert_eq!(specs[1].variants.get("debug"), Some(&VariantValue::Bool(true)));
    assert_eq!(specs[1].variants.get("shared"), Some(&VariantValue::Bool(false)));
}

#[test]
fn parse_rejects_malformed_specs() {
    Spec::parse("^zlib").expect_err("a spec must start with a name");
    Spec::parse("app ^zlib ^zlib").expect_err("repeated dependency must fail");
    Spec::parse("app +mpi ~mpi").expect_err("contradicting variant must fail");
    Spec::parse("app %gcc %clang").expect_err("two compilers must fail");
    Spec::parse("app@").expect_err("missing version must fail");
    Spec::parse("zlib bzip2").expect_err("Spec::parse accepts exactly one spec");
}

#[test]
fn finalize_requires_every_field() {
    let mut spec = Spec::new("zlib");
    spec.version = VersionConstraint::exact(version("1.3"));
    spec.architecture = Some("linux-x86_64".to_string());
    let err = spec.clone().finalize().expect_err("missing compiler must fail");
    assert_eq!(err.missing, "compiler");

    spec.compiler = Some(CompilerSpec::parse("gcc@12").expect("compiler should parse"));
    spec.clone()
        .finalize()
        .expect_err("compiler version range is not concrete");

    spec.compiler = Some(CompilerSpec::parse("gcc@=12.2.0").expect("compiler should parse"));
    let finalized = spec.finalize().expect("fully bound spec should finalize");
    let hash = finalized.hash().expect("finalized spec has a hash");
    assert_eq!(hash.as_str().len(), 64);
    assert_eq!(hash.short().len(), 7);
}

#[test]
fn finalize_rejects_abstract_children() {
    let mut parent = Spec::new("app");
    parent.version = VersionConstraint::exact(version("1.0"));
    parent.compiler = Some(CompilerSpec::parse("gcc@=12.2.0").expect("compiler should parse"));
    parent.architecture = Some("linux-x86_64".to_string());
    parent.dependencies.push(DependencySpec::new(
        Spec::parse("zlib@1.2:").expect("spec should parse"),
        DependencyTypes::build_link(),
    ));
    let err = parent.finalize().expect_err("abstract child must fail");
    assert_eq!(err.missing, "dependency zlib");
}

#[test]
fn content_hash_is_stable_and_ignores_run_and_test_children() {
    let zlib = concrete("zlib", "1.3", Vec::new());
    let tool_one = concrete("tool", "1.0", Vec::new());
    let tool_two = concrete("tool", "2.0", Vec::new());

    let with_tool_one = concrete(
        "app",
        "1.0",
        vec![
            (zlib.clone(), DependencyTypes::build_link()),
            (tool_one, run_only()),
        ],
    );
    let with_tool_two = concrete(
        "app",
        "1.0",
        vec![
            (zlib.clone(), DependencyTypes::build_link()),
            (tool_two.clone(), DependencyTypes::new([DependencyType::Test])),
        ],
    );
    assert_eq!(with_tool_one.hash(), with_tool_two.hash());

    let other_zlib = concrete("zlib", "1.2.13", Vec::new());
    let with_other_zlib = concrete(
        "app",
        "1.0",
        vec![(other_zlib, DependencyTypes::build_link()), (tool_two, run_only())],
    );
    assert_ne!(with_tool_one.hash(), with_other_zlib.hash());

    let again = concrete("zlib", "1.3", Vec::new());
    assert_eq!(again.hash(), zlib.hash());
}

#[test]
fn content_hash_covers_variants() {
    let mut plain = Spec::new("zlib");
    plain.version = VersionConstraint::exact(version("1.3"));
    plain.compiler = Some(CompilerSpec::parse("gcc@=12.2.0").expect("compiler should parse"));
    plain.architecture = Some("linux-x86_64".to_string());
    let mut shared = plain.clone();
    shared.variants.insert("shared".to_string(), VariantValue::Bool(true));

    let plain = plain.finalize().expect("spec should finalize");
    let shared = shared.finalize().expect("spec should finalize");
    assert_ne!(plain.hash(), shared.hash());
}

#[test]
fn concrete_spec_survives_json() {
    let zlib = concrete("zlib", "1.3", Vec::new());
    let app = concrete("app", "1.0", vec![(zlib, DependencyTypes::build_link())]);
    let json = serde_json::to_string(&app).expect("spec should serialize");
    let back: Spec = serde_json::from_str(&json).expect("spec should deserialize");
    assert_eq!(back, app);
    assert!(back.is_concrete());
}

/// `p0 -> a0, b0 -> p1 -> a1, b1 -> ... -> p{levels}`, each `p` shared by
/// both parents above it.
fn diamond_chain(levels: usize) -> Spec {
    fn node(name: String, children: Vec<&Arc<Spec>>) -> Arc<Spec> {
        let mut spec = Spec::new(name);
        spec.version = VersionConstraint::exact(version("1.0"));
        spec.compiler = Some(CompilerSpec::parse("gcc@=12.2.0").expect("compiler should parse"));
        spec.architecture = Some("linux-x86_64".to_string());
        for child in children {
            spec.dependencies
                .push(DependencySpec::new(Arc::clone(child), DependencyTypes::build_link()));
        }
        Arc::new(spec.finalize().expect("spec should finalize"))
    }

    let mut below = node(format!("p{levels}"), Vec::new());
    for level in (0..levels).rev() {
        let left = node(format!("a{level}"), vec![&below]);
        let right = node(format!("b{level}"), vec![&below]);
        below = node(format!("p{level}"), vec![&left, &right]);
    }
    Arc::try_unwrap(below).unwrap_or_else(|shared| (*shared).clone())
}

#[test]
fn shared_subgraphs_are_stored_once() {
    let root = diamond_chain(40);
    assert_eq!(root.traverse().len(), 121);

    let flat = root.flatten();
    assert_eq!(flat.nodes.len(), 121);
    assert_eq!(flat.nodes[0].name, "p0");
    let json = serde_json::to_string(&root).expect("spec should serialize");
    assert!(json.len() < 121 * 400, "json grew to {} bytes", json.len());

    let back: Spec = serde_json::from_str(&json).expect("spec should deserialize");
    assert_eq!(back, root);
    assert_eq!(back.hash(), root.hash());
    let left = &back.dependencies[0].spec;
    let right = &back.dependencies[1].spec;
    assert!(Arc::ptr_eq(&left.dependencies[0].spec, &right.dependencies[0].spec));
    assert_eq!(back.to_string().matches('^').count(), 120);
}

#[test]
fn flat_graphs_with_cycles_or_dangling_edges_are_rejected() {
    let cyclic = r#"{"nodes":[{"name":"a","dependencies":[{"node":1}]},{"name":"b","dependencies":[{"node":0}]}]}"#;
    let err = serde_json::from_str::<Spec>(cyclic).expect_err("cycle must be rejected");
    assert!(err.to_string().contains("cycle"));

    let dangling = r#"{"nodes":[{"name":"a","dependencies":[{"node":7}]}]}"#;
    assert!(serde_json::from_str::<Spec>(dangling).is_err());
    assert!(serde_json::from_str::<Spec>(r#"{"nodes":[]}"#).is_err());
}

#[test]
fn satisfies_checks_nested_dependencies() {
    let zlib = concrete("zlib", "1.3", Vec::new());
    let mut hdf5 = Spec::new("hdf5");
    hdf5.version = VersionConstraint::exact(version("1.14.3"));
    hdf5.compiler = Some(CompilerSpec::parse("gcc@=12.2.0").expect("compiler should parse"));
    hdf5.architecture = Some("linux-x86_64".to_string());
    hdf5.variants.insert("mpi".to_string(), VariantValue::Bool(true));
    hdf5.dependencies.push(DependencySpec::new(zlib, DependencyTypes::build_link()));
    let hdf5 = hdf5.finalize().expect("spec should finalize");

    let wanted = |text: &str| Spec::parse(text).expect("spec should parse");
    assert!(hdf5.satisfies(&wanted("hdf5@1.14 +mpi %gcc@12 ^zlib@1.2:")));
    assert!(!hdf5.satisfies(&wanted("hdf5 ~mpi")));
    assert!(!hdf5.satisfies(&wanted("hdf5 +fortran")));
    assert!(!hdf5.satisfies(&wanted("hdf5 ^zlib@:1.2")));
    assert!(!hdf5.satisfies(&wanted("hdf5 ^szip")));
    assert!(!hdf5.satisfies(&wanted("netcdf")));
}

#[test]
fn constraints_are_unknown_on_abstract_specs() {
    let abstract_spec = Spec::parse("hdf5").expect("spec should parse");
    let mpi = SpecConstraint::parse("+mpi").expect("condition should parse");
    assert_eq!(mpi.evaluate(&abstract_spec), Truth::Unknown);

    let name = SpecConstraint::parse("netcdf").expect("condition should parse");
    assert_eq!(name.evaluate(&abstract_spec), Truth::False);

    let both = SpecConstraint::All(vec![name, mpi]);
    assert_eq!(both.evaluate(&abstract_spec), Truth::False);
}

#[test]
fn anonymous_conditions_parse_key_values() {
    let condition = SpecConstraint::parse("build_type=Debug").expect("condition should parse");
    assert_eq!(
        condition,
        SpecConstraint::Variant {
            name: "build_type".to_string(),
            value: VariantValue::Single("Debug".to_string()),
        }
    );
    let dependency = SpecConstraint::parse("^python@3:").expect("condition should parse");
    assert!(matches!(dependency, SpecConstraint::Dependency { ref name, .. } if name == "python"));
}

const HDF5_TOML: &str = r#"
name = "hdf5"
build_system = "cmake"
homepage = "https://www.hdfgroup.org"
description = "Hierarchical data format"

versions = [
    { version = "1.14.3" },
    { version = "1.12.2", preferred = true },
    { version = "develop" },
]

variants = [
    { name = "mpi", default = true, description = "Enable parallel I/O" },
    { name = "build_type", default = "Release", values = ["Debug", "Release"] },
    { name = "szip", default = false, when = "@1.12:" },
]

dependencies = [
    { spec = "zlib@1.2:" },
    { spec = "mpi", when = "+mpi" },
    { spec = "cmake@3.18:", types = ["build"] },
]

conflicts = [
    { with = "%intel", when = "+mpi", message = "parallel builds need a newer compiler" },
]

provides = [{ spec = "hdf5-api@1", when = "@1.12:" }]
"#;

#[test]
fn parse_declaration() {
    let declaration = PackageDeclaration::from_toml_str(HDF5_TOML).expect("declaration should parse");

    assert_eq!(declaration.name, "hdf5");
    assert_eq!(declaration.build_system, BuildSystem::CMake);
    assert_eq!(declaration.versions.len(), 3);

    let mpi = declaration.variant("mpi").expect("mpi variant declared");
    assert_eq!(mpi.domain(), VariantDomain::Bool);
    assert_eq!(mpi.default, VariantValue::Bool(true));
    let build_type = declaration.variant("build_type").expect("build_type declared");
    assert!(build_type
        .domain()
        .admits(&VariantValue::Single("Debug".to_string())));
    assert!(declaration.variant("szip").and_then(|v| v.when.as_ref()).is_some());

    assert_eq!(declaration.dependencies[0].types, DependencyTypes::build_link());
    assert_eq!(
        declaration.dependencies[2].types,
        DependencyTypes::new([DependencyType::Build])
    );
    assert_eq!(
        declaration.dependencies[1].when,
        Some(SpecConstraint::parse("+mpi").expect("condition should parse"))
    );
    assert_eq!(declaration.conflicts.len(), 1);
    assert!(declaration.provides_virtual("hdf5-api"));
}

#[test]
fn declaration_validation_rejects_bad_records() {
    let bad_default = r#"
name = "zlib"
versions = [{ version = "1.3" }]
variants = [{ name = "opt", default = "O4", values = ["O2", "O3"] }]
"#;
    let err = PackageDeclaration::from_toml_str(bad_default).expect_err("default must be allowed");
    assert!(err.to_string().contains("is not one of"));

    let self_dependency = r#"
name = "zlib"
versions = [{ version = "1.3" }]
dependencies = [{ spec = "zlib" }]
"#;
    PackageDeclaration::from_toml_str(self_dependency).expect_err("self dependency must fail");

    let no_versions = r#"name = "zlib""#;
    PackageDeclaration::from_toml_str(no_versions).expect_err("versions are required");

    let duplicate_version = r#"
name = "zlib"
versions = [{ version = "1.3" }, { version = "1.3" }]
"#;
    PackageDeclaration::from_toml_str(duplicate_version).expect_err("duplicate version must fail");
}

#[test]
fn catalog_answers_virtual_queries() {
    let declare = |name: &str| {
        PackageDeclaration::from_toml_str(&format!(
            "name = \"{name}\"\nversions = [{{ version = \"1.0\" }}]\nprovides = [{{ spec = \"mpi\" }}]\n"
        ))
        .expect("declaration should parse")
    };
    let mut catalog =
        DeclarationCatalog::from_declarations([declare("openmpi"), declare("mpich")])
            .expect("catalog should build");
    catalog.set_default_providers("mpi", vec!["openmpi".to_string()]);

    assert!(catalog.is_virtual("mpi"));
    assert!(!catalog.is_virtual("openmpi"));
    assert!(!catalog.is_virtual("zlib"));
    let providers = catalog
        .providers("mpi")
        .into_iter()
        .map(|declaration| declaration.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(providers, vec!["mpich", "openmpi"]);
    assert_eq!(catalog.default_providers("mpi"), vec!["openmpi"]);

    catalog
        .insert(declare("mpich"))
        .expect_err("duplicate declaration must fail");
}

#[test]
fn build_system_tags() {
    assert_eq!(BuildSystem::parse("CMake"), Some(BuildSystem::CMake));
    assert_eq!(BuildSystem::parse("autoconf"), Some(BuildSystem::Autotools));
    assert_eq!(BuildSystem::parse("ninja"), None);
    assert!(BuildSystem::Bundle.phases().is_empty());
    assert_eq!(BuildSystem::default().as_str(), "generic");
}

#[test]
fn spec_hashes_check_their_shape() {
    let concrete = diamond_chain(1);
    let hash = concrete.hash().expect("concrete");
    assert!(hash.is_well_formed());
    assert_eq!(hash.short().len(), 7);

    let stub: SpecHash = serde_json::from_str("\"ab\"").expect("any string deserializes");
    assert_eq!(stub.short(), "ab");
    assert!(!stub.is_well_formed());
    let upper: SpecHash =
        serde_json::from_str(&format!("\"{}\"", hash.as_str().to_ascii_uppercase())).expect("deserialize");
    assert!(!upper.is_well_formed());
}

//! Record → restore fidelity: every restored file hashes to its catalog
//! digest, modes and symlinks match, and nothing extra appears.

use std::{collections::BTreeSet, path::PathBuf, sync::Arc};

use holotree::{
    library::{Library, RecordMeta},
    space::SpaceManager,
    CancelToken, HolotreeContext, HolotreeOptions, Scorecard,
};
use holotree_digest::{compute_file_digest, Sha256};
use holotree_types::Blueprint;

fn populate_source(root: &std::path::Path) {
    std::fs::create_dir_all(root.join("bin")).unwrap();
    std::fs::create_dir_all(root.join("lib")).unwrap();
    std::fs::create_dir_all(root.join("empty-dir")).unwrap();
    std::fs::write(root.join("bin/python"), b"#!/usr/bin/env fake python\n").unwrap();
    std::fs::write(root.join("lib/x.so"), b"\x7fELF shared object payload").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(
            root.join("bin/python"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();
        std::os::unix::fs::symlink("x.so", root.join("lib/link")).unwrap();
    }
}

fn restored_space(no_compress: bool) -> (tempfile::TempDir, PathBuf, holotree::catalog::Catalog) {
    let home = tempfile::tempdir().unwrap();
    let context = Arc::new(HolotreeContext::new(
        home.path(),
        HolotreeOptions {
            no_compress,
            ..HolotreeOptions::default()
        },
    ));
    let source = tempfile::tempdir().unwrap();
    populate_source(source.path());

    let library = Library::disk(context.clone()).unwrap();
    let blueprint = Blueprint::compose(&[], false).unwrap();
    let catalog = library
        .record(
            &blueprint,
            source.path(),
            RecordMeta::default(),
            &Scorecard::disabled(),
            &CancelToken::new(),
        )
        .unwrap();

    let target = SpaceManager::new(context)
        .restore(
            library.as_disk().unwrap(),
            &blueprint.hash(),
            "fidelity",
            "space",
            &Scorecard::disabled(),
            &CancelToken::new(),
        )
        .unwrap();
    (home, target, catalog)
}

fn walk_relative(root: &std::path::Path) -> BTreeSet<PathBuf> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path() != root)
        .map(|e| e.path().strip_prefix(root).unwrap().to_path_buf())
        .collect()
}

fn catalog_paths(catalog: &holotree::catalog::Catalog) -> BTreeSet<PathBuf> {
    let mut expected = BTreeSet::new();
    catalog
        .treetop::<std::convert::Infallible>(&mut |path, dir| {
            if !path.as_os_str().is_empty() {
                expected.insert(path.to_path_buf());
            }
            for name in dir.files.keys() {
                expected.insert(path.join(name));
            }
            Ok(())
        })
        .unwrap();
    expected
}

fn assert_fidelity(target: &std::path::Path, catalog: &holotree::catalog::Catalog) {
    // No extra files, no missing files.
    assert_eq!(walk_relative(target), catalog_paths(catalog));

    catalog
        .treetop::<std::convert::Infallible>(&mut |path, dir| {
            for (name, entry) in &dir.files {
                let on_disk = target.join(path).join(name);
                if let Some(digest) = &entry.digest {
                    let actual = compute_file_digest::<Sha256>(&on_disk).unwrap();
                    assert_eq!(&format!("{actual:x}"), digest, "digest mismatch at {name}");
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        let mode = std::fs::metadata(&on_disk).unwrap().permissions().mode();
                        assert_eq!(mode & 0o777, entry.mode & 0o777, "mode mismatch at {name}");
                    }
                }
                if let Some(link_target) = &entry.symlink {
                    let actual = std::fs::read_link(&on_disk).unwrap();
                    assert_eq!(&actual, link_target, "symlink mismatch at {name}");
                }
            }
            Ok(())
        })
        .unwrap();
}

#[test]
fn compressed_library_restores_faithfully() {
    let (_home, target, catalog) = restored_space(false);
    assert_fidelity(&target, &catalog);
}

#[test]
fn raw_library_restores_faithfully() {
    let (_home, target, catalog) = restored_space(true);
    assert_fidelity(&target, &catalog);
}

#[test]
fn restored_day_precision_mtime_is_applied() {
    let (_home, target, catalog) = restored_space(true);
    let entry = &catalog.root.dirs["bin"].files["python"];
    let modified = std::fs::metadata(target.join("bin/python"))
        .unwrap()
        .modified()
        .unwrap();
    let restored_day = chrono::DateTime::<chrono::Utc>::from(modified).date_naive();
    assert_eq!(restored_day, entry.mtime);
}

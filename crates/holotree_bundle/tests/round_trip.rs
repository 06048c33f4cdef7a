//! End-to-end bundle flows: export → (appended) → import round trips.

use std::{io::Read, sync::Arc};

use holotree::{
    library::{Library, RecordMeta},
    CancelToken, HolotreeContext, HolotreeOptions, Scorecard,
};
use holotree_bundle::{export::export, import::import, reader::open_bundle};
use holotree_types::Blueprint;

fn open_library(home: &std::path::Path) -> Library {
    let context = Arc::new(HolotreeContext::new(home, HolotreeOptions::default()));
    Library::disk(context).unwrap()
}

fn record_sample(library: &Library, tag: &str) -> String {
    let source = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(source.path().join("bin")).unwrap();
    std::fs::write(source.path().join("bin/python"), format!("fake python {tag}")).unwrap();
    std::fs::write(source.path().join("shared.txt"), b"identical in all envs").unwrap();

    let blueprint = Blueprint {
        channels: vec!["conda-forge".to_owned()],
        conda: vec![format!("python={tag}")],
        pip: Vec::new(),
        pre_run: Vec::new(),
        post_install: Vec::new(),
        dev_dependencies: false,
    };
    let catalog = library
        .record(
            &blueprint,
            source.path(),
            RecordMeta::default(),
            &Scorecard::disabled(),
            &CancelToken::new(),
        )
        .unwrap();
    catalog.name().to_string()
}

#[test]
fn export_import_round_trips_bytes() {
    let home_a = tempfile::tempdir().unwrap();
    let home_b = tempfile::tempdir().unwrap();
    let library_a = open_library(home_a.path());
    let library_b = open_library(home_b.path());
    let disk_a = library_a.as_disk().unwrap();
    let disk_b = library_b.as_disk().unwrap();

    let name_1 = record_sample(&library_a, "3.10.1");
    let name_2 = record_sample(&library_a, "3.11.2");

    let bundle_path = home_a.path().join("export.zip");
    let stats = export(
        disk_a,
        &[name_1.clone(), name_2.clone()],
        &[],
        &bundle_path,
        &CancelToken::new(),
    )
    .unwrap();
    assert_eq!(stats.catalogs, 2);

    let imported = import(disk_b, &bundle_path, &CancelToken::new()).unwrap();
    assert_eq!(imported.catalogs, 2);

    // Catalogs arrive byte-identical; every referenced blob is present with
    // identical content.
    assert_eq!(
        library_b.catalog_names().unwrap(),
        {
            let mut names = vec![name_1.clone(), name_2.clone()];
            names.sort();
            names
        }
    );
    for name in [&name_1, &name_2] {
        assert_eq!(
            disk_a.read_catalog_bytes(name).unwrap(),
            disk_b.read_catalog_bytes(name).unwrap()
        );
        let catalog = disk_b.load_catalog_by_name(name).unwrap();
        for digest in catalog.digests() {
            let mut original = Vec::new();
            disk_a.open(&digest).unwrap().read_to_end(&mut original).unwrap();
            let mut restored = Vec::new();
            disk_b.open(&digest).unwrap().read_to_end(&mut restored).unwrap();
            assert_eq!(original, restored, "blob {digest} diverged");
        }
    }
}

#[test]
fn known_catalogs_prune_shared_blobs() {
    let home = tempfile::tempdir().unwrap();
    let library = open_library(home.path());
    let disk = library.as_disk().unwrap();

    let name_1 = record_sample(&library, "3.10.9");
    let name_2 = record_sample(&library, "3.11.9");

    let full = home.path().join("full.zip");
    let delta = home.path().join("delta.zip");
    let full_stats = export(disk, &[name_2.clone()], &[], &full, &CancelToken::new()).unwrap();
    let delta_stats = export(
        disk,
        &[name_2.clone()],
        &[name_1.clone()],
        &delta,
        &CancelToken::new(),
    )
    .unwrap();

    // `shared.txt` is identical in both environments, so the delta export
    // carries fewer blobs than the full one.
    assert!(delta_stats.blobs < full_stats.blobs);
}

#[test]
fn appended_bundle_imports_like_a_plain_one() {
    let home_a = tempfile::tempdir().unwrap();
    let home_b = tempfile::tempdir().unwrap();
    let library_a = open_library(home_a.path());
    let library_b = open_library(home_b.path());

    let name = record_sample(&library_a, "3.12.0");
    let plain = home_a.path().join("plain.zip");
    export(
        library_a.as_disk().unwrap(),
        &[name.clone()],
        &[],
        &plain,
        &CancelToken::new(),
    )
    .unwrap();

    // Prepend a 4096-byte launcher stub.
    let stubbed = home_a.path().join("stubbed.bin");
    let mut combined = vec![0x7f; 4096];
    combined.extend_from_slice(&std::fs::read(&plain).unwrap());
    std::fs::write(&stubbed, combined).unwrap();

    // Entry payloads are byte-identical between the two forms.
    let mut plain_bundle = open_bundle(&plain).unwrap();
    let mut stubbed_bundle = open_bundle(&stubbed).unwrap();
    assert_eq!(plain_bundle.entry_names(), stubbed_bundle.entry_names());
    for entry in plain_bundle.entry_names() {
        assert_eq!(
            plain_bundle.read_entry(&entry).unwrap(),
            stubbed_bundle.read_entry(&entry).unwrap()
        );
    }

    let stats = import(
        library_b.as_disk().unwrap(),
        &stubbed,
        &CancelToken::new(),
    )
    .unwrap();
    assert_eq!(stats.catalogs, 1);
    assert_eq!(library_b.catalog_names().unwrap(), vec![name]);
}

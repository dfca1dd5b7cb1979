//! Extension lifecycle: registration flows, uninstall safety checks, and
//! the content-addressed archive handling.

mod common;

use std::sync::Arc;

use common::{install_fixture, make_registration, pack_veb, TestEnv, FIXTURE_SHA, FIXTURE_VERSION};

use villagesql_ext::ddl::resolve_type_client_managed;
use villagesql_ext::veb;
use villagesql_ext::vef::library::LoadedExtension;
use villagesql_ext::victionary::entries::ColumnEntry;
use villagesql_ext::victionary::keys::{ColumnKey, ExtensionKey, TypeDescriptorKey, VictionaryKey};
use villagesql_ext::Session;

#[test]
fn test_install_registers_types_functions_and_row() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    let maps = env.runtime.victionary.read_guard();
    let ext = maps
        .extensions
        .get_committed(ExtensionKey::new("fixture").as_str())
        .expect("extensions row committed");
    assert_eq!(ext.extension_version, FIXTURE_VERSION);
    assert_eq!(ext.veb_sha256, FIXTURE_SHA);

    let td_key = TypeDescriptorKey::new("boxed_int", "fixture", FIXTURE_VERSION);
    let descriptor = maps
        .type_descriptors
        .get_committed(td_key.as_str())
        .expect("type descriptor committed");
    assert_eq!(descriptor.persisted_length(), 8);
    assert!(descriptor.hash().is_some());

    assert!(env.runtime.vdfs.find_qualified("fixture", "unbox").is_some());
    assert!(env.runtime.vdfs.find_qualified("FIXTURE", "UNBOX").is_some());
    assert!(env.runtime.vdfs.find_qualified("fixture", "nope").is_none());
}

#[test]
fn test_descriptor_encode_decode_compare() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    let maps = env.runtime.victionary.read_guard();
    let td_key = TypeDescriptorKey::new("boxed_int", "fixture", FIXTURE_VERSION);
    let descriptor = maps.type_descriptors.get_committed(td_key.as_str()).unwrap();

    let encoded = descriptor
        .encode_value(b"7")
        .unwrap()
        .expect("non-null value");
    assert_eq!(encoded, 7i64.to_le_bytes());
    // Canonical round trip.
    let decoded = descriptor.decode_value(&encoded).unwrap();
    assert_eq!(decoded, b"7");
    let re_encoded = descriptor
        .encode_value(&decoded)
        .unwrap()
        .expect("non-null value");
    assert_eq!(re_encoded, encoded);

    let two = descriptor.encode_value(b"2").unwrap().unwrap();
    let ten = descriptor.encode_value(b"10").unwrap().unwrap();
    assert!(descriptor.compare_values(&two, &ten) < 0);
    assert!(descriptor.compare_values(&ten, &two) > 0);
    assert_eq!(descriptor.compare_values(&two, &two), 0);

    // Encoding garbage fails; encoding the text "null" is SQL NULL.
    assert!(descriptor.encode_value(b"twelve").is_err());
    assert!(descriptor.encode_value(b"null").unwrap().is_none());
}

#[test]
fn test_duplicate_install_rejected() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    let loaded = Arc::new(LoadedExtension::from_parts(
        "/fixtures/fixture.so",
        make_registration("fixture", FIXTURE_VERSION),
    ));
    let err = env
        .runtime
        .install_loaded(&session, "fixture", FIXTURE_VERSION, FIXTURE_SHA, loaded)
        .unwrap_err();
    assert!(err.to_string().contains("already installed"));
    env.runtime.end_transaction(&session, true).unwrap();

    // The failed attempt neither unregistered the live functions nor
    // disturbed the committed row.
    assert!(env.runtime.vdfs.find_qualified("fixture", "unbox").is_some());
    let maps = env.runtime.victionary.read_guard();
    assert!(maps
        .extensions
        .get_committed(ExtensionKey::new("fixture").as_str())
        .is_some());
}

#[test]
fn test_uninstall_removes_everything() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    env.runtime
        .uninstall_extension(&session, "fixture")
        .expect("uninstall");

    let maps = env.runtime.victionary.read_guard();
    assert!(maps
        .extensions
        .get_committed(ExtensionKey::new("fixture").as_str())
        .is_none());
    let td_key = TypeDescriptorKey::new("boxed_int", "fixture", FIXTURE_VERSION);
    assert!(maps.type_descriptors.get_committed(td_key.as_str()).is_none());
    assert!(env.runtime.vdfs.find_qualified("fixture", "unbox").is_none());
}

#[test]
fn test_uninstall_of_unknown_extension_fails() {
    let env = TestEnv::new();
    let session = Session::new();
    let err = env
        .runtime
        .uninstall_extension(&session, "ghost")
        .unwrap_err();
    assert!(err.to_string().contains("not installed"));
}

#[test]
fn test_uninstall_restricted_by_dependent_column() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    // A committed column depends on the type.
    {
        let mut maps = env.runtime.victionary.write_guard();
        maps.columns.mark_for_insertion(
            &session,
            ColumnEntry::new(
                ColumnKey::new("db", "t", "x"),
                "fixture",
                FIXTURE_VERSION,
                "boxed_int",
            ),
        );
    }
    env.runtime.victionary.commit_all(&session);

    let err = env
        .runtime
        .uninstall_extension(&session, "fixture")
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("db.t.x"), "message names the column: {}", message);
    assert!(message.contains("1 column(s)"));

    // Dropping the column unblocks the uninstall.
    {
        let mut maps = env.runtime.victionary.write_guard();
        maps.columns
            .mark_for_deletion(&session, &ColumnKey::new("db", "t", "x"));
    }
    env.runtime.victionary.commit_all(&session);

    env.runtime
        .uninstall_extension(&session, "fixture")
        .expect("uninstall after drop");
}

#[test]
fn test_uninstall_refused_while_type_in_use() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    // Something outside the Victionary holds a context handle.
    let held = resolve_type_client_managed(&env.runtime.victionary, Some("fixture"), "boxed_int")
        .unwrap()
        .expect("resolved");

    let err = env
        .runtime
        .uninstall_extension(&session, "fixture")
        .unwrap_err();
    assert!(err.to_string().contains("currently in use"));

    drop(held);
    env.runtime
        .uninstall_extension(&session, "fixture")
        .expect("uninstall after release");
}

#[test]
fn test_reinstall_after_uninstall() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");
    env.runtime
        .uninstall_extension(&session, "fixture")
        .unwrap();
    install_fixture(&env, &session, "fixture");

    let maps = env.runtime.victionary.read_guard();
    let td_key = TypeDescriptorKey::new("boxed_int", "fixture", FIXTURE_VERSION);
    let descriptor = maps
        .type_descriptors
        .get_committed(td_key.as_str())
        .expect("descriptor back after reinstall");
    assert_eq!(descriptor.persisted_length(), 8);
    assert_eq!(descriptor.max_decode_buffer_length(), 32);
}

#[test]
fn test_rollback_discards_partial_install() {
    let env = TestEnv::new();
    let session = Session::new();

    let loaded = Arc::new(LoadedExtension::from_parts(
        "/fixtures/fixture.so",
        make_registration("fixture", FIXTURE_VERSION),
    ));
    env.runtime
        .install_loaded(&session, "fixture", FIXTURE_VERSION, FIXTURE_SHA, loaded)
        .unwrap();
    // The host transaction fails; everything staged must vanish.
    env.runtime.end_transaction(&session, true).unwrap();

    let maps = env.runtime.victionary.read_guard();
    assert!(maps
        .extensions
        .get_committed(ExtensionKey::new("fixture").as_str())
        .is_none());
    let td_key = TypeDescriptorKey::new("boxed_int", "fixture", FIXTURE_VERSION);
    assert!(maps.type_descriptors.get_committed(td_key.as_str()).is_none());
}

// ===== Archive handling =====

#[test]
fn test_manifest_load_and_validation() {
    let env = TestEnv::new();
    pack_veb(env.veb_dir(), "arch", "2.1.0-rc.1", b"not a real so");
    let version = veb::load_veb_manifest(&env.runtime.config, "arch").unwrap();
    assert_eq!(version, "2.1.0-rc.1");

    pack_veb(env.veb_dir(), "badver", "1.0", b"x");
    assert!(veb::load_veb_manifest(&env.runtime.config, "badver").is_err());

    assert!(veb::load_veb_manifest(&env.runtime.config, "missing").is_err());
}

#[test]
fn test_expansion_is_content_addressed() {
    let env = TestEnv::new();
    pack_veb(env.veb_dir(), "arch", "1.0.0", b"so bytes v1");

    let (path1, sha1) = veb::expand_veb_to_directory(&env.runtime.config, "arch").unwrap();
    assert!(path1.join("manifest.json").exists());
    assert!(veb::extension_so_path(&env.runtime.config, "arch", &sha1).exists());
    assert_eq!(sha1.len(), 64);

    // Same archive bytes reuse the same directory.
    let (path2, sha2) = veb::expand_veb_to_directory(&env.runtime.config, "arch").unwrap();
    assert_eq!(path1, path2);
    assert_eq!(sha1, sha2);

    // Different archive bytes land in a sibling directory.
    pack_veb(env.veb_dir(), "arch", "1.0.0", b"so bytes v2");
    let (path3, sha3) = veb::expand_veb_to_directory(&env.runtime.config, "arch").unwrap();
    assert_ne!(sha1, sha3);
    assert_ne!(path1, path3);
    assert!(path1.exists());
    assert!(path3.exists());
}

#[test]
fn test_orphaned_expansions_are_garbage_collected() {
    let env = TestEnv::new();
    pack_veb(env.veb_dir(), "arch", "1.0.0", b"v1");
    let (old_path, _old_sha) = veb::expand_veb_to_directory(&env.runtime.config, "arch").unwrap();
    pack_veb(env.veb_dir(), "arch", "1.0.0", b"v2");
    let (new_path, new_sha) = veb::expand_veb_to_directory(&env.runtime.config, "arch").unwrap();

    pack_veb(env.veb_dir(), "gone", "1.0.0", b"v1");
    let (gone_path, _) = veb::expand_veb_to_directory(&env.runtime.config, "gone").unwrap();

    let installed = std::collections::HashMap::from([("arch".to_string(), new_sha)]);
    veb::cleanup_orphaned_expansions(&env.runtime.config, &installed);

    assert!(!old_path.exists(), "stale hash removed");
    assert!(new_path.exists(), "current hash kept");
    assert!(!gone_path.exists(), "uninstalled extension removed");
}

#[test]
fn test_archive_path_traversal_rejected() {
    let env = TestEnv::new();

    // Build an archive with an escaping entry by hand.
    let file = std::fs::File::create(env.veb_dir().join("evil.veb")).unwrap();
    let mut builder = tar::Builder::new(file);
    let manifest = br#"{"version": "1.0.0"}"#;
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "manifest.json", manifest.as_slice())
        .unwrap();
    let mut header = tar::Header::new_gnu();
    header.set_size(4);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "lib/../../evil", b"oops".as_slice())
        .unwrap();
    builder.finish().unwrap();

    let err = veb::expand_veb_to_directory(&env.runtime.config, "evil").unwrap_err();
    assert!(err.to_string().contains("relative path"), "{}", err);
}

#[test]
fn test_install_requires_valid_name_and_archive() {
    let env = TestEnv::new();
    let session = Session::new();

    let err = env
        .runtime
        .install_extension(&session, "1bad")
        .unwrap_err();
    assert!(err.to_string().contains("must start with a letter"));

    // Valid name, no archive on disk.
    let err = env
        .runtime
        .install_extension(&session, "nosuch")
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn test_sha256_matches_known_vector() {
    let env = TestEnv::new();
    let path = env.dir.path().join("empty.bin");
    std::fs::write(&path, b"").unwrap();
    assert_eq!(
        veb::calculate_file_sha256(&path).unwrap(),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );

    std::fs::write(&path, b"abc").unwrap();
    assert_eq!(
        veb::calculate_file_sha256(&path).unwrap(),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
}

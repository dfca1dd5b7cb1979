//! DDL staging: resolution of custom types from SQL, column metadata
//! changes through CREATE/ALTER/DROP/RENAME, and the locking interplay
//! with uninstall.

mod common;

use std::time::Duration;

use common::{install_fixture, TestEnv, FIXTURE_VERSION};

use villagesql_ext::ddl::sql::process_sql;
use villagesql_ext::ddl::{
    custom_type_for_column, ensure_supported_engine, resolve_type, table_has_custom_columns,
    AlterColumnChange, AlterSpec, CreateFieldInfo, CustomTypeRef, MetadataModifier,
};
use villagesql_ext::victionary::keys::{ColumnKey, VictionaryKey};
use villagesql_ext::{Arena, Error, Session};

fn commit_ddl(env: &TestEnv, session: &Session) {
    MetadataModifier::store(&env.runtime, session).unwrap();
    env.runtime.end_transaction(session, false).unwrap();
    session.release_statement_locks();
}

fn fixture_ref() -> CustomTypeRef {
    CustomTypeRef {
        extension_name: "fixture".to_string(),
        extension_version: FIXTURE_VERSION.to_string(),
        type_name: "boxed_int".to_string(),
    }
}

#[test]
fn test_resolve_type_by_name_and_qualified() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    let arena = Arena::new();
    let tc = resolve_type(&env.runtime.victionary, None, "boxed_int", &arena)
        .unwrap()
        .expect("resolved bare name");
    assert_eq!(tc.type_name(), "boxed_int");
    assert_eq!(tc.extension_name(), "fixture");
    assert_eq!(tc.extension_version(), FIXTURE_VERSION);
    assert!(tc.parameters().is_empty());

    let tc = resolve_type(&env.runtime.victionary, Some("fixture"), "BOXED_INT", &arena)
        .unwrap()
        .expect("resolved qualified, case-insensitive");
    assert_eq!(tc.type_name(), "boxed_int");

    assert!(resolve_type(&env.runtime.victionary, None, "nosuch", &arena)
        .unwrap()
        .is_none());
    assert!(
        resolve_type(&env.runtime.victionary, Some("other"), "boxed_int", &arena)
            .unwrap()
            .is_none()
    );

    // Compatibility is (type, extension, version) identity.
    let a = resolve_type(&env.runtime.victionary, None, "boxed_int", &arena)
        .unwrap()
        .unwrap();
    let b = resolve_type(&env.runtime.victionary, None, "raw_word", &arena)
        .unwrap()
        .unwrap();
    assert!(a.is_compatible_with(a));
    assert!(!a.is_compatible_with(b));
}

#[test]
fn test_create_table_stages_custom_columns() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    process_sql(
        &env.runtime,
        &session,
        "CREATE TABLE t (id INT, x BOXED_INT, y fixture.boxed_int)",
    )
    .unwrap();

    // Staged, not yet committed.
    {
        let maps = env.runtime.victionary.read_guard();
        let key = ColumnKey::new("test", "t", "x");
        assert!(maps.columns.get(Some(&session), key.as_str()).is_some());
        assert!(maps.columns.get_committed(key.as_str()).is_none());
    }

    commit_ddl(&env, &session);

    let maps = env.runtime.victionary.read_guard();
    let entry = maps
        .columns
        .get_committed(ColumnKey::new("test", "t", "x").as_str())
        .expect("column committed");
    assert_eq!(entry.extension_name, "fixture");
    assert_eq!(entry.extension_version, FIXTURE_VERSION);
    assert_eq!(entry.type_name, "boxed_int");
    assert!(maps
        .columns
        .get_committed(ColumnKey::new("test", "t", "y").as_str())
        .is_some());
    // The INT column is not tracked.
    assert!(maps
        .columns
        .get_committed(ColumnKey::new("test", "t", "id").as_str())
        .is_none());
    drop(maps);

    assert!(table_has_custom_columns(&env.runtime.victionary, "test", "t"));
    assert!(!table_has_custom_columns(&env.runtime.victionary, "test", "other"));
}

#[test]
fn test_unknown_type_rejected() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    let err = process_sql(&env.runtime, &session, "CREATE TABLE t (x NOSUCHTYPE)").unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{}", err);
    assert!(err.to_string().contains("Unknown data type"));
}

#[test]
fn test_special_databases_not_tracked() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    process_sql(
        &env.runtime,
        &session,
        "CREATE TABLE mysql.t (x BOXED_INT)",
    )
    .unwrap();
    commit_ddl(&env, &session);

    let maps = env.runtime.victionary.read_guard();
    assert!(maps
        .columns
        .get_committed(ColumnKey::new("mysql", "t", "x").as_str())
        .is_none());
}

#[test]
fn test_alter_drop_rename_and_add_columns() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    process_sql(
        &env.runtime,
        &session,
        "CREATE TABLE t (a BOXED_INT, b BOXED_INT)",
    )
    .unwrap();
    commit_ddl(&env, &session);

    process_sql(&env.runtime, &session, "ALTER TABLE t DROP COLUMN a").unwrap();
    commit_ddl(&env, &session);
    {
        let maps = env.runtime.victionary.read_guard();
        assert!(maps
            .columns
            .get_committed(ColumnKey::new("test", "t", "a").as_str())
            .is_none());
        assert!(maps
            .columns
            .get_committed(ColumnKey::new("test", "t", "b").as_str())
            .is_some());
    }

    process_sql(
        &env.runtime,
        &session,
        "ALTER TABLE t RENAME COLUMN b TO b2",
    )
    .unwrap();
    commit_ddl(&env, &session);
    {
        let maps = env.runtime.victionary.read_guard();
        assert!(maps
            .columns
            .get_committed(ColumnKey::new("test", "t", "b").as_str())
            .is_none());
        let renamed = maps
            .columns
            .get_committed(ColumnKey::new("test", "t", "b2").as_str())
            .expect("renamed entry");
        assert_eq!(renamed.type_name, "boxed_int");
        assert_eq!(renamed.extension_name, "fixture");
    }

    process_sql(
        &env.runtime,
        &session,
        "ALTER TABLE t ADD COLUMN c BOXED_INT",
    )
    .unwrap();
    commit_ddl(&env, &session);
    {
        let maps = env.runtime.victionary.read_guard();
        assert!(maps
            .columns
            .get_committed(ColumnKey::new("test", "t", "c").as_str())
            .is_some());
    }
}

#[test]
fn test_alter_rename_table_moves_columns() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    process_sql(&env.runtime, &session, "CREATE TABLE t (x BOXED_INT)").unwrap();
    commit_ddl(&env, &session);

    process_sql(&env.runtime, &session, "ALTER TABLE t RENAME TO t2").unwrap();
    commit_ddl(&env, &session);

    let maps = env.runtime.victionary.read_guard();
    assert!(maps
        .columns
        .get_committed(ColumnKey::new("test", "t", "x").as_str())
        .is_none());
    let moved = maps
        .columns
        .get_committed(ColumnKey::new("test", "t2", "x").as_str())
        .expect("moved to new table");
    assert_eq!(moved.type_name, "boxed_int");
}

#[test]
fn test_drop_table_removes_all_custom_columns() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    process_sql(
        &env.runtime,
        &session,
        "CREATE TABLE t (x BOXED_INT, y BOXED_INT)",
    )
    .unwrap();
    commit_ddl(&env, &session);

    process_sql(&env.runtime, &session, "DROP TABLE t").unwrap();
    commit_ddl(&env, &session);

    assert!(!table_has_custom_columns(&env.runtime.victionary, "test", "t"));
}

#[test]
fn test_modify_custom_to_custom_is_remove_then_insert() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    MetadataModifier::process_create(
        &env.runtime,
        &session,
        "test",
        "t",
        &[CreateFieldInfo {
            name: "x".to_string(),
            custom: Some(fixture_ref()),
        }],
        Some("InnoDB"),
    )
    .unwrap();
    commit_ddl(&env, &session);

    // MODIFY x to the other custom type: same key, remove then insert.
    let alter = AlterSpec {
        changes: vec![AlterColumnChange {
            old_name: Some("x".to_string()),
            new_name: "x".to_string(),
            custom: Some(CustomTypeRef {
                extension_name: "fixture".to_string(),
                extension_version: FIXTURE_VERSION.to_string(),
                type_name: "raw_word".to_string(),
            }),
        }],
        ..AlterSpec::default()
    };
    MetadataModifier::process_alter(&env.runtime, &session, "test", "t", &alter, Some("InnoDB"))
        .unwrap();
    commit_ddl(&env, &session);

    let maps = env.runtime.victionary.read_guard();
    let entry = maps
        .columns
        .get_committed(ColumnKey::new("test", "t", "x").as_str())
        .expect("column survives the modify");
    assert_eq!(entry.type_name, "raw_word");
}

#[test]
fn test_modify_custom_to_builtin_removes_entry() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    MetadataModifier::process_create(
        &env.runtime,
        &session,
        "test",
        "t",
        &[CreateFieldInfo {
            name: "x".to_string(),
            custom: Some(fixture_ref()),
        }],
        None,
    )
    .unwrap();
    commit_ddl(&env, &session);

    let alter = AlterSpec {
        changes: vec![AlterColumnChange {
            old_name: Some("x".to_string()),
            new_name: "x".to_string(),
            custom: None,
        }],
        ..AlterSpec::default()
    };
    MetadataModifier::process_alter(&env.runtime, &session, "test", "t", &alter, None).unwrap();
    commit_ddl(&env, &session);

    assert!(!table_has_custom_columns(&env.runtime.victionary, "test", "t"));
}

#[test]
fn test_engine_gate() {
    assert!(ensure_supported_engine(None, "CREATE TABLE").is_ok());
    assert!(ensure_supported_engine(Some("InnoDB"), "CREATE TABLE").is_ok());
    assert!(ensure_supported_engine(Some("innodb"), "CREATE TABLE").is_ok());
    let err = ensure_supported_engine(Some("MyISAM"), "CREATE TABLE").unwrap_err();
    assert!(err.to_string().contains("MyISAM"));
}

#[test]
fn test_validation_rejects_unknown_descriptor() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    let err = MetadataModifier::process_create(
        &env.runtime,
        &session,
        "test",
        "t",
        &[CreateFieldInfo {
            name: "x".to_string(),
            custom: Some(CustomTypeRef {
                extension_name: "fixture".to_string(),
                extension_version: "9.9.9".to_string(),
                type_name: "boxed_int".to_string(),
            }),
        }],
        None,
    )
    .unwrap_err();
    assert!(err.to_string().contains("not found"), "{}", err);
    session.release_statement_locks();
}

#[test]
fn test_uninstall_blocked_by_sql_created_column() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    process_sql(&env.runtime, &session, "CREATE TABLE t (x BOXED_INT)").unwrap();
    commit_ddl(&env, &session);

    let err = env
        .runtime
        .uninstall_extension(&session, "fixture")
        .unwrap_err();
    assert!(err.to_string().contains("test.t.x"), "{}", err);

    process_sql(&env.runtime, &session, "DROP TABLE t").unwrap();
    commit_ddl(&env, &session);

    env.runtime
        .uninstall_extension(&session, "fixture")
        .expect("uninstall after drop table");
}

#[test]
fn test_process_calls_validates_and_locks() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    // Known function: stages nothing but takes the shared lock.
    MetadataModifier::process_calls(
        &env.runtime,
        &session,
        &[("fixture".to_string(), "unbox".to_string())],
    )
    .unwrap();

    // While the statement holds the shared lock, uninstall cannot take the
    // exclusive lock.
    let mut other = Session::new();
    other.set_lock_wait_timeout(Duration::from_millis(20));
    let err = env
        .runtime
        .uninstall_extension(&other, "fixture")
        .unwrap_err();
    assert!(err.to_string().contains("Lock wait timeout"), "{}", err);

    session.release_statement_locks();
    env.runtime
        .uninstall_extension(&other, "fixture")
        .expect("uninstall after statement end");
}

#[test]
fn test_process_calls_unknown_function_or_extension() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    let err = MetadataModifier::process_calls(
        &env.runtime,
        &session,
        &[("fixture".to_string(), "nosuch".to_string())],
    )
    .unwrap_err();
    assert!(err.to_string().contains("not found in extension"));
    session.release_statement_locks();

    let err = MetadataModifier::process_calls(
        &env.runtime,
        &session,
        &[("ghost".to_string(), "unbox".to_string())],
    )
    .unwrap_err();
    assert!(err.to_string().contains("Extension 'ghost' not found"));
    session.release_statement_locks();
}

#[test]
fn test_query_function_references_processed() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    process_sql(&env.runtime, &session, "SELECT fixture.unbox(x) FROM t").unwrap();
    session.release_statement_locks();

    let err =
        process_sql(&env.runtime, &session, "SELECT fixture.nosuch(x) FROM t").unwrap_err();
    assert!(err.to_string().contains("not found in extension"));
    session.release_statement_locks();
}

#[test]
fn test_custom_type_for_column_injection() {
    let env = TestEnv::new();
    let session = Session::new();
    install_fixture(&env, &session, "fixture");

    process_sql(&env.runtime, &session, "CREATE TABLE t (x BOXED_INT)").unwrap();

    // The creating session sees its own staged column metadata.
    let arena = Arena::new();
    let tc = custom_type_for_column(
        &env.runtime.victionary,
        &session,
        "test",
        "t",
        "x",
        &arena,
    )
    .unwrap()
    .expect("uncommitted column visible to its session");
    assert_eq!(tc.type_name(), "boxed_int");

    // Other sessions do not, until commit.
    let other = Session::new();
    assert!(custom_type_for_column(
        &env.runtime.victionary,
        &other,
        "test",
        "t",
        "x",
        &arena
    )
    .unwrap()
    .is_none());

    commit_ddl(&env, &session);

    let tc = custom_type_for_column(
        &env.runtime.victionary,
        &other,
        "test",
        "t",
        "x",
        &arena,
    )
    .unwrap()
    .expect("committed column visible everywhere");
    assert_eq!(tc.extension_name(), "fixture");

    // Non-custom columns resolve to nothing.
    assert!(custom_type_for_column(
        &env.runtime.victionary,
        &other,
        "test",
        "t",
        "other_col",
        &arena
    )
    .unwrap()
    .is_none());
}

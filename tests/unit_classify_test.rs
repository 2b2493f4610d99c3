use pgrelay::core::router::classify::{StatementKind, classify_statement};

fn classify(sql: &str) -> StatementKind {
    classify_statement(sql, true)
}

#[test]
fn test_plain_select_is_read() {
    assert_eq!(classify("SELECT * FROM t"), StatementKind::Read);
    assert_eq!(classify("select 1"), StatementKind::Read);
    assert_eq!(classify("TABLE t"), StatementKind::Read);
}

#[test]
fn test_leading_whitespace_and_comments() {
    assert_eq!(classify("   \n\t SELECT 1"), StatementKind::Read);
    assert_eq!(classify("-- comment\nSELECT 1"), StatementKind::Read);
    assert_eq!(classify("/* block */ SELECT 1"), StatementKind::Read);
    assert_eq!(classify("/* a */ -- b\nSELECT 1"), StatementKind::Read);
}

#[test]
fn test_leading_whitespace_respected_when_disabled() {
    // With ignore_leading_white_space off, an indented SELECT is not
    // recognized as a read and routes conservatively.
    assert_eq!(classify_statement("  SELECT 1", false), StatementKind::Write);
    assert_eq!(classify_statement("SELECT 1", false), StatementKind::Read);
}

#[test]
fn test_locking_selects_are_writes() {
    assert_eq!(classify("SELECT * FROM t FOR UPDATE"), StatementKind::Write);
    assert_eq!(classify("SELECT * FROM t FOR SHARE"), StatementKind::Write);
}

#[test]
fn test_advisory_locks_pin_to_primary() {
    assert_eq!(
        classify("SELECT pg_advisory_lock(42)"),
        StatementKind::Write
    );
    assert_eq!(classify("SELECT nextval('seq')"), StatementKind::Write);
}

#[test]
fn test_dml_is_write() {
    assert_eq!(classify("INSERT INTO t VALUES (1)"), StatementKind::Write);
    assert_eq!(classify("UPDATE t SET x = 1"), StatementKind::Write);
    assert_eq!(classify("DELETE FROM t"), StatementKind::Write);
    assert_eq!(classify("TRUNCATE t"), StatementKind::Write);
}

#[test]
fn test_explain_variants() {
    assert_eq!(classify("EXPLAIN SELECT 1"), StatementKind::Read);
    assert_eq!(
        classify("EXPLAIN ANALYZE DELETE FROM t"),
        StatementKind::Write
    );
}

#[test]
fn test_show_is_read() {
    assert_eq!(classify("SHOW server_version"), StatementKind::Read);
}

#[test]
fn test_writing_cte_is_write() {
    assert_eq!(
        classify("WITH x AS (INSERT INTO t VALUES (1) RETURNING id) SELECT * FROM x"),
        StatementKind::Write
    );
    assert_eq!(
        classify("WITH x AS (SELECT 1) SELECT * FROM x"),
        StatementKind::Read
    );
}

#[test]
fn test_transaction_control() {
    assert_eq!(classify("BEGIN"), StatementKind::Begin);
    assert_eq!(classify("START TRANSACTION"), StatementKind::Begin);
    assert_eq!(classify("COMMIT"), StatementKind::Commit);
    assert_eq!(classify("END"), StatementKind::Commit);
    assert_eq!(classify("ROLLBACK"), StatementKind::Rollback);
    assert_eq!(classify("ABORT"), StatementKind::Rollback);
    assert_eq!(classify("SAVEPOINT sp1"), StatementKind::Savepoint);
    assert_eq!(classify("ROLLBACK TO sp1"), StatementKind::Savepoint);
    assert_eq!(classify("RELEASE sp1"), StatementKind::Release);
}

#[test]
fn test_session_affecting_statements() {
    assert_eq!(
        classify("SET application_name = 'foo'"),
        StatementKind::SessionAffecting
    );
    assert_eq!(classify("RESET ALL"), StatementKind::SessionAffecting);
    assert_eq!(
        classify("PREPARE q AS SELECT 1"),
        StatementKind::SessionAffecting
    );
    assert_eq!(classify("DEALLOCATE q"), StatementKind::SessionAffecting);
    assert_eq!(classify("LISTEN chan"), StatementKind::SessionAffecting);
    assert_eq!(classify("DISCARD ALL"), StatementKind::SessionAffecting);
    assert_eq!(
        classify("CREATE TEMP TABLE scratch (x int)"),
        StatementKind::SessionAffecting
    );
    assert_eq!(
        classify("CREATE TEMPORARY TABLE scratch (x int)"),
        StatementKind::SessionAffecting
    );
}

#[test]
fn test_create_table_is_write() {
    assert_eq!(classify("CREATE TABLE t (x int)"), StatementKind::Write);
}

#[test]
fn test_copy() {
    assert_eq!(classify("COPY t FROM STDIN"), StatementKind::Copy);
    assert!(StatementKind::Copy.is_write());
}

#[test]
fn test_empty_statement() {
    assert_eq!(classify(""), StatementKind::Empty);
    assert_eq!(classify("   "), StatementKind::Empty);
    assert_eq!(classify("-- only a comment"), StatementKind::Empty);
}

// src/core/router/classify.rs

//! Statement classification: just enough lexing to tell reads from writes
//! from session-affecting statements. This is deliberately not a SQL parser;
//! transaction boundaries remain authoritative from `ReadyForQuery`.

/// The classes the router distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// `SELECT` without locking clauses, `SHOW`, `EXPLAIN` without `ANALYZE`.
    Read,
    /// Anything that can change data or schema.
    Write,
    /// Statements that mutate server-global session state and must reach
    /// every backend: `SET`, `RESET`, `PREPARE`/`DEALLOCATE`, temporary
    /// objects, `LISTEN`/`UNLISTEN`.
    SessionAffecting,
    Begin,
    Commit,
    Rollback,
    Savepoint,
    Release,
    /// `COPY ... FROM STDIN` / `TO STDOUT`.
    Copy,
    /// Empty query.
    Empty,
}

impl StatementKind {
    pub fn is_write(self) -> bool {
        matches!(self, StatementKind::Write | StatementKind::Copy)
    }
}

/// Strips leading whitespace and SQL comments (`--` and `/* */`).
fn strip_leading(sql: &str, ignore_leading_white_space: bool) -> &str {
    let mut rest = sql;
    loop {
        let trimmed = if ignore_leading_white_space {
            rest.trim_start()
        } else {
            rest
        };
        if let Some(after) = trimmed.strip_prefix("--") {
            match after.find('\n') {
                Some(pos) => {
                    rest = &after[pos + 1..];
                    continue;
                }
                None => return "",
            }
        }
        if let Some(after) = trimmed.strip_prefix("/*") {
            match after.find("*/") {
                Some(pos) => {
                    rest = &after[pos + 2..];
                    continue;
                }
                None => return "",
            }
        }
        return trimmed;
    }
}

/// The first whitespace-delimited keyword, uppercased.
fn first_keyword(sql: &str) -> String {
    sql.split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
}

fn second_keyword(sql: &str) -> String {
    sql.split_whitespace()
        .nth(1)
        .unwrap_or("")
        .trim_end_matches(';')
        .to_ascii_uppercase()
}

fn contains_keyword(sql: &str, keyword: &str) -> bool {
    let upper = sql.to_ascii_uppercase();
    upper
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|tok| tok == keyword)
}

/// Classifies one statement's text.
pub fn classify_statement(sql: &str, ignore_leading_white_space: bool) -> StatementKind {
    let sql = strip_leading(sql, ignore_leading_white_space);
    if sql.trim().is_empty() {
        return StatementKind::Empty;
    }

    match first_keyword(sql).as_str() {
        "SELECT" | "TABLE" | "VALUES" => {
            // Locking clauses and write CTEs force the primary.
            if contains_keyword(sql, "UPDATE")
                || contains_keyword(sql, "DELETE")
                || contains_keyword(sql, "INSERT")
                || contains_keyword(sql, "SHARE")
                || contains_keyword(sql, "INTO")
            {
                StatementKind::Write
            } else if contains_keyword(sql, "PG_ADVISORY_LOCK")
                || contains_keyword(sql, "PG_ADVISORY_UNLOCK")
                || contains_keyword(sql, "PG_ADVISORY_XACT_LOCK")
                || contains_keyword(sql, "SETVAL")
                || contains_keyword(sql, "NEXTVAL")
                || contains_keyword(sql, "LO_CREAT")
                || contains_keyword(sql, "LO_IMPORT")
            {
                // Advisory locks and sequence/large-object functions are
                // session- or data-affecting; they return rows, so multicast
                // is unsupported and they pin to the primary instead.
                StatementKind::Write
            } else {
                StatementKind::Read
            }
        }
        "SHOW" => StatementKind::Read,
        "EXPLAIN" => {
            if contains_keyword(sql, "ANALYZE") {
                StatementKind::Write
            } else {
                StatementKind::Read
            }
        }
        "WITH" => {
            // A CTE containing any data-modifying verb routes as a write.
            if contains_keyword(sql, "UPDATE")
                || contains_keyword(sql, "DELETE")
                || contains_keyword(sql, "INSERT")
            {
                StatementKind::Write
            } else {
                StatementKind::Read
            }
        }

        "BEGIN" | "START" => StatementKind::Begin,
        "COMMIT" | "END" => StatementKind::Commit,
        "ROLLBACK" | "ABORT" => {
            if second_keyword(sql) == "TO" {
                StatementKind::Savepoint
            } else {
                StatementKind::Rollback
            }
        }
        "SAVEPOINT" => StatementKind::Savepoint,
        "RELEASE" => StatementKind::Release,

        "SET" | "RESET" => StatementKind::SessionAffecting,
        "PREPARE" | "DEALLOCATE" => StatementKind::SessionAffecting,
        "LISTEN" | "UNLISTEN" => StatementKind::SessionAffecting,
        "DISCARD" => StatementKind::SessionAffecting,
        "CREATE" => {
            let second = second_keyword(sql);
            if second == "TEMP" || second == "TEMPORARY" {
                StatementKind::SessionAffecting
            } else {
                StatementKind::Write
            }
        }

        "COPY" => StatementKind::Copy,

        _ => StatementKind::Write,
    }
}

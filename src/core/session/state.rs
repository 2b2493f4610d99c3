// src/core/session/state.rs

//! Per-session router state: transaction tracking, prepared-statement
//! book-keeping, copy mode, and the sticky load-balance node.

use std::collections::HashMap;

/// State the router consults and updates across one frontend session.
///
/// Transaction boundaries are authoritative from `ReadyForQuery`'s status
/// byte; statement-text hints only pre-position the advisory depth so a
/// backend can be chosen before the backend replies.
#[derive(Debug)]
pub struct SessionRouterState {
    /// Last `ReadyForQuery` status byte: `I` idle, `T` in transaction,
    /// `E` in failed transaction.
    pub tx_status: u8,
    /// Advisory transaction depth from observed statement text.
    advisory_depth: u32,
    /// True once the current transaction has issued any write.
    write_in_tx: bool,
    /// True while relaying `CopyData` for an in-flight COPY.
    pub in_copy: bool,
    /// Sticky replica for balanced reads; `None` forces reselection.
    pub load_balance_node: Option<usize>,
    /// Named prepared statements and the backends that saw their `Parse`.
    pub prepared: HashMap<String, Vec<usize>>,
    /// Portal name -> statement name, from `Bind`.
    pub portals: HashMap<String, String>,
    /// Targets of the unnamed statement; lives until the next `Sync`.
    pub unnamed_targets: Option<Vec<usize>>,
    /// Targets of the statement currently awaiting replies.
    pub last_targets: Vec<usize>,
    /// Nodes that completed a multicast statement another node failed;
    /// rolled back at the next sync point.
    pub pending_rollback: Vec<usize>,
}

impl Default for SessionRouterState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRouterState {
    pub fn new() -> Self {
        Self {
            tx_status: b'I',
            advisory_depth: 0,
            write_in_tx: false,
            in_copy: false,
            load_balance_node: None,
            prepared: HashMap::new(),
            portals: HashMap::new(),
            unnamed_targets: None,
            last_targets: Vec::new(),
            pending_rollback: Vec::new(),
        }
    }

    /// In a transaction, by backend report or by advisory hint.
    pub fn in_transaction(&self) -> bool {
        self.tx_status != b'I' || self.advisory_depth > 0
    }

    /// True once routing must stay pinned to the primary: the transaction
    /// has issued a write and is not yet back to idle.
    pub fn write_pinned(&self) -> bool {
        self.in_transaction() && self.write_in_tx
    }

    /// Records that a write was routed while in a transaction.
    pub fn note_write(&mut self) {
        if self.in_transaction() {
            self.write_in_tx = true;
        }
    }

    /// Advisory hint from statement text, applied before the backend replies.
    pub fn hint_begin(&mut self) {
        self.advisory_depth = self.advisory_depth.saturating_add(1);
    }

    /// Advisory hint for COMMIT/ROLLBACK.
    pub fn hint_end(&mut self) {
        self.advisory_depth = self.advisory_depth.saturating_sub(1);
    }

    /// Applies the authoritative transaction status from `ReadyForQuery`.
    pub fn observe_ready(&mut self, status: u8) {
        self.tx_status = status;
        if status == b'I' {
            self.advisory_depth = 0;
            self.write_in_tx = false;
        }
    }

    /// Records a named `Parse` and its target set.
    pub fn record_parse(&mut self, name: &str, targets: Vec<usize>) {
        if name.is_empty() {
            self.unnamed_targets = Some(targets);
        } else {
            self.prepared.insert(name.to_string(), targets);
        }
    }

    /// Targets of a previously parsed statement.
    pub fn statement_targets(&self, name: &str) -> Option<&Vec<usize>> {
        if name.is_empty() {
            self.unnamed_targets.as_ref()
        } else {
            self.prepared.get(name)
        }
    }

    /// Records a `Bind`, mapping the portal to its statement.
    pub fn record_bind(&mut self, portal: &str, statement: &str) {
        self.portals.insert(portal.to_string(), statement.to_string());
    }

    /// Targets of the statement behind a portal.
    pub fn portal_targets(&self, portal: &str) -> Option<&Vec<usize>> {
        let statement = self.portals.get(portal)?;
        self.statement_targets(statement)
    }

    /// Drops a closed statement or portal.
    pub fn record_close(&mut self, kind: u8, name: &str) {
        match kind {
            b'S' => {
                if name.is_empty() {
                    self.unnamed_targets = None;
                } else {
                    self.prepared.remove(name);
                }
            }
            b'P' => {
                self.portals.remove(name);
            }
            _ => {}
        }
    }

    /// End-of-pipeline cleanup at `Sync`: unnamed statements and portals
    /// do not survive it.
    pub fn observe_sync(&mut self) {
        self.unnamed_targets = None;
        self.portals.clear();
    }
}

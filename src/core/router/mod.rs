// src/core/router/mod.rs

//! The per-statement query router: classifies statements, selects target
//! backends, and merges replies for multicast statements.

pub mod balancer;
pub mod classify;
pub mod merger;

use crate::core::session::state::SessionRouterState;
use crate::core::status::StatusSnapshot;
use classify::StatementKind;

/// Which backend(s) a message is dispatched to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    PrimaryOnly,
    AnyReplica(usize),
    AllBackends,
    Specific(usize),
}

/// The routing decision for one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub target: RouteTarget,
    /// True when replies from every target must be reconciled into one.
    pub must_merge: bool,
}

impl RouteDecision {
    fn primary() -> Self {
        Self {
            target: RouteTarget::PrimaryOnly,
            must_merge: false,
        }
    }
}

/// Router configuration distilled from the pooler config.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub load_balance_mode: bool,
    pub statement_level_load_balance: bool,
    pub ignore_leading_white_space: bool,
    pub delay_threshold: u64,
}

/// The per-session router. Holds the sticky load-balance node when
/// statement-level balancing is off.
#[derive(Debug)]
pub struct Router {
    settings: RouterSettings,
}

impl Router {
    pub fn new(settings: RouterSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    /// Decides where one simple-protocol statement goes. Rules are checked
    /// in order; the first match wins.
    pub fn decide(
        &self,
        sql: &str,
        session: &mut SessionRouterState,
        snapshot: &StatusSnapshot,
    ) -> RouteDecision {
        let kind = classify::classify_statement(sql, self.settings.ignore_leading_white_space);
        self.decide_kind(kind, session, snapshot)
    }

    pub fn decide_kind(
        &self,
        kind: StatementKind,
        session: &mut SessionRouterState,
        snapshot: &StatusSnapshot,
    ) -> RouteDecision {
        // Rule 1: a transaction that has written is pinned to the primary
        // until ReadyForQuery reports idle.
        if session.write_pinned() {
            if kind.is_write() {
                session.note_write();
            }
            return RouteDecision::primary();
        }

        match kind {
            // Rule 2: server-global session state changes go everywhere and
            // their replies are merged.
            StatementKind::SessionAffecting => RouteDecision {
                target: RouteTarget::AllBackends,
                must_merge: true,
            },

            // Rule 3: reads may load balance outside a transaction, or
            // always under statement-level balancing.
            StatementKind::Read
                if self.settings.load_balance_mode
                    && (!session.in_transaction()
                        || self.settings.statement_level_load_balance) =>
            {
                self.balance_read(session, snapshot)
            }

            StatementKind::Begin
            | StatementKind::Savepoint
            | StatementKind::Release
            | StatementKind::Commit
            | StatementKind::Rollback => {
                // Transaction control follows the session's current target so
                // a balanced read-only transaction stays on its replica.
                match session.load_balance_node {
                    Some(node) if snapshot.entries.get(node).is_some_and(|e| e.selectable()) => {
                        RouteDecision {
                            target: RouteTarget::Specific(node),
                            must_merge: false,
                        }
                    }
                    _ => RouteDecision::primary(),
                }
            }

            StatementKind::Write => {
                session.note_write();
                RouteDecision::primary()
            }

            // Rule 4: everything else goes to the primary.
            _ => RouteDecision::primary(),
        }
    }

    fn balance_read(
        &self,
        session: &mut SessionRouterState,
        snapshot: &StatusSnapshot,
    ) -> RouteDecision {
        if self.settings.statement_level_load_balance {
            session.load_balance_node = None;
        }

        // Sticky selection: reuse the session's replica while it stays
        // selectable, silently reselecting between statements otherwise.
        if let Some(node) = session.load_balance_node {
            if snapshot
                .entries
                .get(node)
                .is_some_and(|e| e.selectable() && self.lag_ok(e.replication_lag))
            {
                return RouteDecision {
                    target: RouteTarget::AnyReplica(node),
                    must_merge: false,
                };
            }
            session.load_balance_node = None;
        }

        match balancer::select_replica(snapshot, self.settings.delay_threshold) {
            Some(node) => {
                session.load_balance_node = Some(node);
                RouteDecision {
                    target: RouteTarget::AnyReplica(node),
                    must_merge: false,
                }
            }
            None => RouteDecision::primary(),
        }
    }

    fn lag_ok(&self, lag: u64) -> bool {
        self.settings.delay_threshold == 0 || lag <= self.settings.delay_threshold
    }
}

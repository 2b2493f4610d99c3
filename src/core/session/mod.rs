// src/core/session/mod.rs

//! The frontend session: owns the client socket, borrows a pool slot, and
//! runs the main relay loop between the frontend and the routed backends.

pub mod state;

use crate::core::RelayError;
use crate::core::backend::pool::{PoolCache, PoolKey, PoolSlot};
use crate::core::failover::{FailoverRequest, NodeRequestKind, RequestOrigin};
use crate::core::protocol::auth::{self, FrontendAuthPolicy};
use crate::core::protocol::message::{Message, MessageCodec, tags};
use crate::core::protocol::startup::StartupPacket;
use crate::core::router::classify::{StatementKind, classify_statement};
use crate::core::router::merger::{MergeOutcome, ReplyMerger};
use crate::core::router::{RouteDecision, RouteTarget, Router, RouterSettings};
use crate::core::state::{CancelEntry, ControlEvent, Runtime, ShutdownMode};
use crate::core::status::TransitionReason;
use futures::{SinkExt, StreamExt};
use state::SessionRouterState;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Why a session ended; drives worker recycling.
#[derive(Debug)]
pub enum SessionEnd {
    ClientClosed,
    /// The worker must invalidate its pool cache and recycle.
    Recycle,
    Shutdown(ShutdownMode),
}

/// One step of an extended-protocol pipeline awaiting replies at `Sync`.
#[derive(Debug, Clone)]
struct PipelineStep {
    tag: u8,
    targets: Vec<usize>,
}

/// Serves one authenticated frontend connection to completion: runs the
/// authentication exchange, binds a pool slot, and enters the main loop.
/// Returns the session end reason; the pool slot is returned to the cache
/// when it is still clean.
pub async fn serve<S>(
    stream: S,
    startup: StartupPacket,
    runtime: Arc<Runtime>,
    worker_id: usize,
    cache: &mut PoolCache,
    control: &mut broadcast::Receiver<ControlEvent>,
) -> Result<SessionEnd, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = runtime.config();
    let mut framed = Framed::new(stream, MessageCodec);
    let user = startup.user().to_string();
    let database = startup.database().to_string();

    let policy = if config.enable_pool_hba {
        FrontendAuthPolicy::Password
    } else {
        FrontendAuthPolicy::Trust
    };
    if let Err(e) = auth::authenticate_frontend(&mut framed, &user, &runtime.credentials, policy).await
    {
        let reply = Message::error_response("FATAL", "28P01", &e.to_string());
        let _ = framed.send(reply).await;
        return Err(e);
    }

    // Acquire the pool slot: cache hit with liveness/generation validation,
    // or a fresh slot across the currently valid backends.
    let key = PoolKey::new(&user, &database, startup.protocol_major());
    let generation = runtime.status.generation();
    let pool = match cache.take(&key, generation, &runtime.credentials).await {
        Some(slot) => slot,
        None => {
            let snapshot = runtime.status.snapshot();
            match PoolSlot::create(key, &snapshot, &runtime.credentials).await {
                Ok(mut slot) => {
                    slot.checkout();
                    slot
                }
                Err(e) => {
                    let reply = Message::error_response(
                        "FATAL",
                        "53300",
                        &format!("could not connect to any backend: {e}"),
                    );
                    let _ = framed.send(reply).await;
                    return Err(e);
                }
            }
        }
    };

    // Advertise the cached parameter-status mirror and a synthetic cancel
    // key that maps back to the pool slot's backend pid/key pairs.
    for (param, value) in &pool.params {
        framed.send(Message::parameter_status(param, value)).await?;
    }
    let frontend_key = runtime.next_frontend_key();
    runtime.cancel_map.insert(
        frontend_key,
        CancelEntry {
            targets: pool.cancel_targets(),
            current: None,
        },
    );
    framed
        .send(Message::backend_key_data(frontend_key.0, frontend_key.1))
        .await?;
    framed.send(Message::ready_for_query(b'I')).await?;

    let session_id = runtime.next_session_id();
    debug!("Session {session_id} started for {user}@{database} on worker {worker_id}");

    let settings = RouterSettings {
        load_balance_mode: config.load_balance_mode,
        statement_level_load_balance: config.statement_level_load_balance,
        ignore_leading_white_space: config.ignore_leading_white_space,
        delay_threshold: config.delay_threshold,
    };

    let mut session = Session {
        session_id,
        framed,
        pool,
        router: Router::new(settings),
        state: SessionRouterState::new(),
        runtime: runtime.clone(),
        frontend_key,
        pipeline: Vec::new(),
    };

    let result = session.run(control).await;

    runtime.cancel_map.remove(&frontend_key);
    let Session {
        mut pool, state, ..
    } = session;

    match &result {
        Ok(SessionEnd::ClientClosed)
            if !state.in_transaction()
                && !state.in_copy
                && pool.generation == runtime.status.generation() =>
        {
            cache.put(pool).await;
        }
        _ => {
            pool.close_all().await;
        }
    }
    result
}

struct Session<S> {
    session_id: u64,
    framed: Framed<S, MessageCodec>,
    pool: PoolSlot,
    router: Router,
    state: SessionRouterState,
    runtime: Arc<Runtime>,
    frontend_key: (i32, i32),
    pipeline: Vec<PipelineStep>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// The main loop. Control events are observed only here, between
    /// statements, which makes the idle boundary the reload boundary.
    async fn run(
        &mut self,
        control: &mut broadcast::Receiver<ControlEvent>,
    ) -> Result<SessionEnd, RelayError> {
        loop {
            tokio::select! {
                biased;
                event = control.recv() => {
                    match event {
                        Ok(ControlEvent::Shutdown(ShutdownMode::Smart)) => {
                            // Smart shutdown lets the session finish; the
                            // worker stops accepting afterwards.
                            continue;
                        }
                        Ok(ControlEvent::Shutdown(mode)) => {
                            return self.shutdown(mode).await;
                        }
                        Ok(ControlEvent::Reload) | Ok(ControlEvent::BackendStateSync) => {
                            // Restart the session at this idle point.
                            if !self.state.in_transaction() {
                                info!(
                                    "Session {} recycling after state sync",
                                    self.session_id
                                );
                                let reply = Message::error_response(
                                    "FATAL",
                                    "57P01",
                                    "backend state changed; please reconnect",
                                );
                                let _ = self.framed.send(reply).await;
                                return Ok(SessionEnd::Recycle);
                            }
                            continue;
                        }
                        Err(_) => continue,
                    }
                }
                incoming = self.framed.next() => {
                    let msg = match incoming {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) if e.is_disconnect() => return Ok(SessionEnd::ClientClosed),
                        Some(Err(e)) => return Err(e),
                        None => return Ok(SessionEnd::ClientClosed),
                    };
                    match self.handle_frontend_message(msg).await {
                        Ok(true) => continue,
                        Ok(false) => return Ok(SessionEnd::ClientClosed),
                        Err(e) => {
                            // Surface every error to the frontend first, then
                            // decide the session's fate.
                            self.report_error(&e).await;
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    async fn shutdown(&mut self, mode: ShutdownMode) -> Result<SessionEnd, RelayError> {
        if mode == ShutdownMode::Fast {
            let reply =
                Message::error_response("FATAL", "57P01", "terminating connection on shutdown");
            let _ = self.framed.send(reply).await;
            self.pool.close_all().await;
        }
        Ok(SessionEnd::Shutdown(mode))
    }

    async fn report_error(&mut self, e: &RelayError) {
        let reply = Message::error_response("ERROR", "XX000", &e.to_string());
        let _ = self.framed.send(reply).await;
        let _ = self.framed.send(Message::ready_for_query(b'E')).await;
    }

    /// Dispatches one frontend message. Returns false when the session is
    /// over (Terminate).
    async fn handle_frontend_message(&mut self, msg: Message) -> Result<bool, RelayError> {
        match msg.tag {
            tags::TERMINATE => {
                self.rollback_if_needed().await;
                Ok(false)
            }
            tags::QUERY => {
                let sql = msg.as_query()?.to_string();
                self.handle_query(&sql, msg).await?;
                Ok(true)
            }
            tags::PARSE | tags::BIND | tags::DESCRIBE | tags::EXECUTE | tags::CLOSE => {
                self.handle_extended(msg).await?;
                Ok(true)
            }
            tags::SYNC => {
                self.handle_sync().await?;
                Ok(true)
            }
            tags::FLUSH => {
                // Flush pushes buffered messages out; replies stream back at
                // the next Sync.
                for node in self.pipeline_participants() {
                    self.pool.slot_mut(node)?.send(Message::new(tags::FLUSH, msg.body.clone())).await?;
                }
                Ok(true)
            }
            tags::COPY_DATA | tags::COPY_DONE | tags::COPY_FAIL => {
                // Copy traffic outside an active COPY is a client bug.
                Err(RelayError::ProtocolViolation(
                    "COPY message outside COPY mode".into(),
                ))
            }
            tags::PASSWORD_MESSAGE => {
                // Pass-through type: nothing expects it at this point.
                debug!("Ignoring unexpected PasswordMessage mid-session");
                Ok(true)
            }
            other => Err(RelayError::ProtocolViolation(format!(
                "unexpected frontend message '{}'",
                other as char
            ))),
        }
    }

    // --- Simple protocol ---

    async fn handle_query(&mut self, sql: &str, msg: Message) -> Result<(), RelayError> {
        let kind = classify_statement(sql, self.router.settings().ignore_leading_white_space);
        match kind {
            StatementKind::Begin => self.state.hint_begin(),
            StatementKind::Commit | StatementKind::Rollback => self.state.hint_end(),
            _ => {}
        }

        let snapshot = self.runtime.status.snapshot();
        let decision = self.router.decide_kind(kind, &mut self.state, &snapshot);

        match decision {
            RouteDecision { target: RouteTarget::AllBackends, must_merge: true } => {
                self.multicast_query(msg).await
            }
            RouteDecision { target, .. } => {
                let node = self.resolve_single_target(&target)?;
                self.state.last_targets = vec![node];
                self.set_cancel_current(Some(node));
                let replayable = matches!(target, RouteTarget::AnyReplica(_));
                self.forward_and_relay(node, msg, replayable).await
            }
        }
    }

    /// Maps a route target onto a node present in this pool slot.
    fn resolve_single_target(&mut self, target: &RouteTarget) -> Result<usize, RelayError> {
        let snapshot = self.runtime.status.snapshot();
        let primary = snapshot
            .primary()
            .map(|e| e.node_id)
            .filter(|id| self.pool.slot(*id).is_some());

        match target {
            RouteTarget::PrimaryOnly => primary.ok_or(RelayError::NoEligibleBackend),
            RouteTarget::Specific(node) | RouteTarget::AnyReplica(node) => {
                if self.pool.slot(*node).is_some()
                    && snapshot.entries.get(*node).is_some_and(|e| e.selectable())
                {
                    Ok(*node)
                } else {
                    // The chosen replica disappeared between statements:
                    // silently reselect by falling back to the primary.
                    self.state.load_balance_node = None;
                    primary.ok_or(RelayError::NoEligibleBackend)
                }
            }
            RouteTarget::AllBackends => primary.ok_or(RelayError::NoEligibleBackend),
        }
    }

    /// Forwards one simple-protocol statement and streams the backend's
    /// replies to the frontend until `ReadyForQuery`. A replica that dies
    /// before any reply byte reached the client is replaced by the primary
    /// and the statement replayed.
    async fn forward_and_relay(
        &mut self,
        node: usize,
        msg: Message,
        replayable: bool,
    ) -> Result<(), RelayError> {
        self.pool.slot_mut(node)?.send(msg.clone()).await?;
        match self.relay_until_ready(node, true).await {
            Ok(()) => Ok(()),
            Err(RelayFailure::BeforeFirstByte(e)) if replayable => {
                warn!(
                    "Session {}: replica {node} failed before replying ({e}); replaying on primary",
                    self.session_id
                );
                self.pool.discard_backend(node).await;
                self.state.load_balance_node = None;
                let snapshot = self.runtime.status.snapshot();
                let primary = snapshot
                    .primary()
                    .map(|e| e.node_id)
                    .filter(|id| self.pool.slot(*id).is_some())
                    .ok_or(RelayError::NoEligibleBackend)?;
                self.state.last_targets = vec![primary];
                self.set_cancel_current(Some(primary));
                self.pool.slot_mut(primary)?.send(msg).await?;
                self.relay_until_ready(primary, true).await.map_err(RelayFailure::into_inner)
            }
            Err(failure) => Err(failure.into_inner()),
        }
    }

    /// Streams replies from one backend to the frontend until
    /// `ReadyForQuery`, servicing COPY sub-protocols inline.
    async fn relay_until_ready(
        &mut self,
        node: usize,
        forward: bool,
    ) -> Result<(), RelayFailure> {
        let mut sent_anything = false;
        loop {
            let msg = match self.pool.slot_mut(node).map_err(RelayFailure::mid(sent_anything))?.recv().await {
                Ok(msg) => msg,
                Err(e) => {
                    self.note_backend_failure(node, &e).await;
                    return Err(if sent_anything {
                        RelayFailure::MidStream(e)
                    } else {
                        RelayFailure::BeforeFirstByte(e)
                    });
                }
            };

            match msg.tag {
                tags::PARAMETER_STATUS => {
                    if let Ok((param, value)) = msg.as_parameter_status() {
                        self.pool.record_parameter(param, value);
                    }
                    if forward {
                        self.framed.send(msg).await.map_err(RelayFailure::MidStream)?;
                        sent_anything = true;
                    }
                }
                tags::READY_FOR_QUERY => {
                    let status = msg.ready_status().map_err(RelayFailure::MidStream)?;
                    self.state.observe_ready(status);
                    self.set_cancel_current(None);
                    if forward {
                        self.framed.send(msg).await.map_err(RelayFailure::MidStream)?;
                    }
                    return Ok(());
                }
                tags::COPY_IN_RESPONSE => {
                    self.state.in_copy = true;
                    if forward {
                        self.framed.send(msg).await.map_err(RelayFailure::MidStream)?;
                        sent_anything = true;
                    }
                    self.relay_copy_in(node).await.map_err(RelayFailure::MidStream)?;
                    self.state.in_copy = false;
                }
                tags::ERROR_RESPONSE => {
                    let fatal = msg
                        .error_fields()
                        .map(|(severity, _, _)| severity == "FATAL")
                        .unwrap_or(false);
                    if forward {
                        self.framed.send(msg).await.map_err(RelayFailure::MidStream)?;
                        sent_anything = true;
                    }
                    if fatal {
                        // A FATAL backend error takes the node out of service.
                        self.raise_backend_failure(node);
                    }
                }
                _ => {
                    if forward {
                        self.framed.send(msg).await.map_err(RelayFailure::MidStream)?;
                        sent_anything = true;
                    }
                }
            }
        }
    }

    /// Frontend -> backend half of `COPY ... FROM STDIN`.
    async fn relay_copy_in(&mut self, node: usize) -> Result<(), RelayError> {
        loop {
            let msg = match self.framed.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(e),
                None => {
                    // Client vanished mid-copy; tell the backend to abort.
                    let fail = Message::new(
                        tags::COPY_FAIL,
                        bytes::Bytes::from_static(b"client disconnected\0"),
                    );
                    self.pool.slot_mut(node)?.send(fail).await?;
                    return Err(RelayError::Io(std::sync::Arc::new(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "client disconnected during COPY",
                    ))));
                }
            };
            let done = matches!(msg.tag, tags::COPY_DONE | tags::COPY_FAIL);
            self.pool.slot_mut(node)?.send(msg).await?;
            if done {
                return Ok(());
            }
        }
    }

    // --- Multicast ---

    /// Sends a session-affecting statement to every backend in the pool
    /// slot, merges the terminal replies, and forwards one copy.
    async fn multicast_query(&mut self, msg: Message) -> Result<(), RelayError> {
        let targets = self.pool.node_ids();
        self.state.last_targets = targets.clone();
        self.set_cancel_current(None);

        // Forward to all targets before awaiting any reply.
        for node in &targets {
            self.pool.slot_mut(*node)?.feed(msg.clone()).await?;
        }
        for node in &targets {
            self.pool.slot_mut(*node)?.flush().await?;
        }

        let mut merger = ReplyMerger::new(targets.clone());
        let mut ready_status = b'I';
        for node in &targets {
            // Per target: collect until ReadyForQuery, recording the
            // terminal reply. Ordering across targets is by arrival of
            // this loop; reconciliation is by command tag.
            loop {
                let reply = self.pool.slot_mut(*node)?.recv().await?;
                match reply.tag {
                    tags::PARAMETER_STATUS => {
                        if let Ok((param, value)) = reply.as_parameter_status() {
                            self.pool.record_parameter(param, value);
                        }
                    }
                    tags::READY_FOR_QUERY => {
                        ready_status = reply.ready_status()?;
                        break;
                    }
                    _ if reply.is_command_boundary() => {
                        merger.record(*node, reply);
                    }
                    _ => {
                        // Row-returning multicast is downgraded before
                        // dispatch; anything else here is dropped.
                        debug!(
                            "Dropping non-mergeable multicast reply '{}' from node {node}",
                            reply.tag as char
                        );
                    }
                }
            }
        }

        match merger.finish()? {
            MergeOutcome::Agreed(reply) => {
                self.framed.send(reply).await?;
            }
            MergeOutcome::Errored {
                error,
                completed_nodes,
            } => {
                self.framed.send(error).await?;
                // Nodes that completed get an implicit rollback at this
                // sync point when a transaction is open.
                if self.state.in_transaction() {
                    for node in completed_nodes {
                        if let Ok(slot) = self.pool.slot_mut(node) {
                            let _ = slot.simple_query("ROLLBACK").await;
                        }
                    }
                }
            }
        }

        self.state.observe_ready(ready_status);
        self.framed.send(Message::ready_for_query(ready_status)).await?;
        Ok(())
    }

    // --- Extended protocol ---

    /// Routes one extended-protocol message, forwarding it immediately to
    /// its targets and recording the step for reply relay at `Sync`.
    async fn handle_extended(&mut self, msg: Message) -> Result<(), RelayError> {
        let targets: Vec<usize> = match msg.tag {
            tags::PARSE => {
                let (name, query) = msg.as_parse()?;
                let name = name.to_string();
                let kind = classify_statement(
                    query,
                    self.router.settings().ignore_leading_white_space,
                );
                let snapshot = self.runtime.status.snapshot();
                let decision = self.router.decide_kind(kind, &mut self.state, &snapshot);
                let targets = match decision.target {
                    RouteTarget::AllBackends => self.pool.node_ids(),
                    target => vec![self.resolve_single_target(&target)?],
                };
                self.state.record_parse(&name, targets.clone());
                targets
            }
            tags::BIND => {
                let (portal, statement) = msg.as_bind()?;
                let (portal, statement) = (portal.to_string(), statement.to_string());
                let targets = self
                    .state
                    .statement_targets(&statement)
                    .cloned()
                    .unwrap_or_else(|| self.fallback_targets());
                self.state.record_bind(&portal, &statement);
                targets
            }
            tags::DESCRIBE => {
                let (kind, name) = msg.as_close_or_describe()?;
                let name = name.to_string();
                match kind {
                    b'S' => self.state.statement_targets(&name).cloned(),
                    _ => self.state.portal_targets(&name).cloned(),
                }
                .unwrap_or_else(|| self.fallback_targets())
            }
            tags::EXECUTE => {
                let portal = msg.as_execute().map(|(p, _)| p).unwrap_or("").to_string();
                self.state
                    .portal_targets(&portal)
                    .cloned()
                    .unwrap_or_else(|| self.fallback_targets())
            }
            tags::CLOSE => {
                let (kind, name) = msg.as_close_or_describe()?;
                let name = name.to_string();
                let targets = match kind {
                    b'S' => self.state.statement_targets(&name).cloned(),
                    _ => self.state.portal_targets(&name).cloned(),
                }
                .unwrap_or_else(|| self.fallback_targets());
                self.state.record_close(kind, &name);
                targets
            }
            _ => unreachable!("handle_extended called for non-extended tag"),
        };

        for node in &targets {
            self.pool.slot_mut(*node)?.feed(msg.clone()).await?;
        }
        self.pipeline.push(PipelineStep {
            tag: msg.tag,
            targets,
        });
        Ok(())
    }

    fn fallback_targets(&mut self) -> Vec<usize> {
        // An unknown statement or portal routes like a write.
        match self.resolve_single_target(&RouteTarget::PrimaryOnly) {
            Ok(node) => vec![node],
            Err(_) => self.pool.node_ids(),
        }
    }

    fn pipeline_participants(&self) -> Vec<usize> {
        let mut nodes: Vec<usize> = self
            .pipeline
            .iter()
            .flat_map(|step| step.targets.iter().copied())
            .collect();
        nodes.sort_unstable();
        nodes.dedup();
        if nodes.is_empty() {
            self.pool.node_ids()
        } else {
            nodes
        }
    }

    /// `Sync`: forward it to every pipeline participant, then relay replies
    /// step by step in the order the client sent its messages.
    async fn handle_sync(&mut self) -> Result<(), RelayError> {
        let participants = self.pipeline_participants();
        self.state.last_targets = participants.clone();

        for node in &participants {
            let slot = self.pool.slot_mut(*node)?;
            slot.feed(Message::sync()).await?;
            slot.flush().await?;
        }

        let steps = std::mem::take(&mut self.pipeline);
        // Backends that errored skip the rest of their pipeline until Sync.
        let mut errored: Vec<usize> = Vec::new();
        let mut error_forwarded = false;

        for step in &steps {
            for (i, node) in step.targets.iter().enumerate() {
                if errored.contains(node) {
                    continue;
                }
                // Forward intermediate replies only from the first target so
                // a multicast step yields a single reply stream.
                let forward = i == 0 && !error_forwarded;
                match self.relay_step(*node, step.tag, forward).await? {
                    StepOutcome::Done => {}
                    StepOutcome::Errored(error) => {
                        if !error_forwarded {
                            self.framed.send(error).await?;
                            error_forwarded = true;
                        }
                        errored.push(*node);
                    }
                }
            }
        }

        // Every participant answers the Sync with ReadyForQuery; the
        // frontend sees the worst of the reported statuses.
        let mut ready_status = b'I';
        for node in &participants {
            match self.await_ready(*node).await? {
                b'E' => ready_status = b'E',
                b'T' if ready_status != b'E' => ready_status = b'T',
                _ => {}
            }
        }
        self.state.observe_ready(ready_status);
        self.state.observe_sync();
        self.set_cancel_current(None);
        self.framed.send(Message::ready_for_query(ready_status)).await?;
        Ok(())
    }

    /// Relays one backend's replies for one pipeline step, up to the step's
    /// terminal message.
    async fn relay_step(
        &mut self,
        node: usize,
        step_tag: u8,
        forward: bool,
    ) -> Result<StepOutcome, RelayError> {
        loop {
            let reply = self.pool.slot_mut(node)?.recv().await?;
            match reply.tag {
                tags::PARAMETER_STATUS => {
                    if let Ok((param, value)) = reply.as_parameter_status() {
                        self.pool.record_parameter(param, value);
                    }
                    continue;
                }
                tags::ERROR_RESPONSE => {
                    return Ok(StepOutcome::Errored(reply));
                }
                tags::READY_FOR_QUERY => {
                    // A step should never see this; the backend got ahead of
                    // us, which means the step's message was skipped.
                    return Err(RelayError::ProtocolViolation(
                        "backend reached ReadyForQuery mid-pipeline".into(),
                    ));
                }
                _ => {}
            }

            let terminal = match step_tag {
                tags::PARSE => reply.tag == tags::PARSE_COMPLETE,
                tags::BIND => reply.tag == tags::BIND_COMPLETE,
                tags::CLOSE => reply.tag == tags::CLOSE_COMPLETE,
                tags::DESCRIBE => {
                    matches!(reply.tag, tags::ROW_DESCRIPTION | tags::NO_DATA)
                }
                tags::EXECUTE => matches!(
                    reply.tag,
                    tags::COMMAND_COMPLETE
                        | tags::EMPTY_QUERY_RESPONSE
                        | tags::PORTAL_SUSPENDED
                ),
                _ => true,
            };

            if forward {
                self.framed.send(reply).await?;
            }
            if terminal {
                return Ok(StepOutcome::Done);
            }
        }
    }

    async fn await_ready(&mut self, node: usize) -> Result<u8, RelayError> {
        loop {
            let reply = self.pool.slot_mut(node)?.recv().await?;
            match reply.tag {
                tags::READY_FOR_QUERY => return reply.ready_status(),
                tags::PARAMETER_STATUS => {
                    if let Ok((param, value)) = reply.as_parameter_status() {
                        self.pool.record_parameter(param, value);
                    }
                }
                _ => {
                    debug!(
                        "Discarding straggler '{}' from node {node} while syncing",
                        reply.tag as char
                    );
                }
            }
        }
    }

    // --- Failure plumbing ---

    /// Records which backend executes the in-flight statement so cancel
    /// requests reach the right process.
    fn set_cancel_current(&self, node: Option<usize>) {
        if let Some(mut entry) = self.runtime.cancel_map.get_mut(&self.frontend_key) {
            entry.current = node;
        }
    }

    async fn note_backend_failure(&mut self, node: usize, e: &RelayError) {
        warn!(
            "Session {}: backend {node} transport error: {e}",
            self.session_id
        );
        self.raise_backend_failure(node);
    }

    /// Posts a suspected-failure request for a backend that errored fatally
    /// mid-session. The health controller and executor adjudicate it.
    fn raise_backend_failure(&self, node: usize) {
        let generation = self.runtime.status.generation();
        self.runtime.post_request(FailoverRequest::node(
            node,
            NodeRequestKind::Quarantine,
            TransitionReason::Quarantine,
            RequestOrigin::Health,
            generation,
        ));
        self.runtime.post_request(FailoverRequest::node(
            node,
            NodeRequestKind::Detach,
            TransitionReason::HealthFail,
            RequestOrigin::Health,
            generation,
        ));
    }

    async fn rollback_if_needed(&mut self) {
        if self.state.in_transaction() {
            for node in self.state.last_targets.clone() {
                if let Ok(slot) = self.pool.slot_mut(node) {
                    let _ = slot.simple_query("ROLLBACK").await;
                }
            }
        }
    }
}

/// Distinguishes a backend failure before anything reached the client (the
/// statement may be replayed elsewhere) from one mid-stream (the session
/// must fail).
enum RelayFailure {
    BeforeFirstByte(RelayError),
    MidStream(RelayError),
}

impl RelayFailure {
    fn into_inner(self) -> RelayError {
        match self {
            RelayFailure::BeforeFirstByte(e) | RelayFailure::MidStream(e) => e,
        }
    }

    fn mid(sent_anything: bool) -> impl Fn(RelayError) -> RelayFailure {
        move |e| {
            if sent_anything {
                RelayFailure::MidStream(e)
            } else {
                RelayFailure::BeforeFirstByte(e)
            }
        }
    }
}

enum StepOutcome {
    Done,
    Errored(Message),
}

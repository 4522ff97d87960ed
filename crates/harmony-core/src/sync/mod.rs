//! Sync coordinator - offline-first dispatch and reconciliation
//!
//! The coordinator decides, per emergency event, which channel to use
//! (remote server, local-network broadcast, or queued-for-later), drains
//! the pending queue once connectivity returns, and owns de-duplication
//! and conflict handling for status transitions. Collaborators are
//! injected as trait objects so every decision path is testable with
//! fakes and no wall-clock waits.

mod broadcast;
mod connectivity;
mod remote;

pub use broadcast::{
    subnet_broadcast_addr, BroadcastFrame, BroadcastListener, Broadcaster, UdpBroadcaster,
    BROADCAST_PORT, MAGIC_PREFIX,
};
pub use connectivity::{ConnectivityOracle, Reachability, RouteConnectivity, SharedConnectivity};
pub use remote::{HttpDispatchClient, RemoteDispatch, RemoteEmergency};

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::{
    Database, EmergencyRepository, LibSqlEmergencyRepository, LibSqlPendingOperationRepository,
    PendingOperationRepository,
};
use crate::error::{Error, Result};
use crate::models::{
    CreateEmergencyPayload, Emergency, EmergencyId, EmergencyStatus, OperationKind,
    PendingOperation, UpdateStatusPayload,
};

/// External collaborator notified of inbound emergencies and batch
/// results. Consumers (notifications, UI) must not block these calls.
pub trait AlertSink: Send + Sync {
    /// A locally created emergency was durably recorded
    fn on_emergency_created_locally(&self, emergency: &Emergency);
    /// A peer broadcast was accepted as a fresh local candidate
    fn on_emergency_received_from_peer(&self, emergency: &Emergency);
    /// A queue drain finished
    fn on_sync_batch_complete(&self, report: &SyncReport);
}

/// Sink that only logs, for hosts without a notification surface
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn on_emergency_created_locally(&self, emergency: &Emergency) {
        info!(id = %emergency.id, elderly_id = emergency.elderly_id, "emergency recorded");
    }

    fn on_emergency_received_from_peer(&self, emergency: &Emergency) {
        info!(id = %emergency.id, elderly_id = emergency.elderly_id, "emergency received from peer");
    }

    fn on_sync_batch_complete(&self, report: &SyncReport) {
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "sync batch complete"
        );
    }
}

/// How a submission was delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubmitOutcome {
    /// The server confirmed the record and assigned an id
    Delivered { server_id: i64 },
    /// Durably queued for a later drain; `broadcast` reports whether a
    /// best-effort LAN announcement was also fired
    Queued { broadcast: bool },
}

/// A durably recorded submission
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub emergency: Emergency,
    pub outcome: SubmitOutcome,
}

/// How a completion/cancellation was delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolveOutcome {
    /// Applied on the server and locally
    Synced,
    /// Applied locally, update queued for a later drain
    Queued,
    /// Applied locally only; the record was never confirmed by the server
    LocalOnly,
}

/// Why a drain walk stopped before exhausting the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DrainStop {
    /// Connectivity was lost before or during the walk
    ConnectivityLost,
}

/// Outcome of one `sync_all` run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Operations applied remotely and deleted from the queue
    pub succeeded: usize,
    /// Operations that failed and stay queued for the next pass
    pub failed: usize,
    /// Unreadable operations dropped from the queue
    pub skipped: usize,
    /// Set when the walk halted early
    pub stopped: Option<DrainStop>,
}

enum Replay {
    Applied,
    Dropped,
}

/// The central orchestrator. One instance per device, shared behind `Arc`.
pub struct SyncCoordinator {
    db: Arc<Database>,
    remote: Arc<dyn RemoteDispatch>,
    oracle: Arc<dyn ConnectivityOracle>,
    broadcaster: Arc<dyn Broadcaster>,
    sink: Arc<dyn AlertSink>,
}

impl SyncCoordinator {
    pub fn new(
        db: Arc<Database>,
        remote: Arc<dyn RemoteDispatch>,
        oracle: Arc<dyn ConnectivityOracle>,
        broadcaster: Arc<dyn Broadcaster>,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            db,
            remote,
            oracle,
            broadcaster,
            sink,
        }
    }

    /// Record a new emergency and deliver it via the best available channel.
    ///
    /// Success means the request is durably recorded locally, not that it
    /// reached the server. The only fatal class is a storage failure:
    /// when neither the server write nor the durable enqueue succeeded.
    pub async fn submit(&self, elderly_id: i64, latitude: f64, longitude: f64) -> Result<Submission> {
        let mut emergency = Emergency::new(elderly_id, latitude, longitude);
        let emergencies = LibSqlEmergencyRepository::new(self.db.connection());
        emergencies.insert(&emergency).await?;

        let reachability = self.oracle.classify();
        if reachability == Reachability::ServerReachable {
            match self.remote.create_emergency(&emergency).await {
                Ok(server_id) => {
                    emergencies.assign_server_id(&emergency.id, server_id).await?;
                    emergency.server_id = Some(server_id);
                    self.sink.on_emergency_created_locally(&emergency);
                    info!(id = %emergency.id, server_id, "emergency delivered to server");
                    return Ok(Submission {
                        emergency,
                        outcome: SubmitOutcome::Delivered { server_id },
                    });
                }
                Err(err) => {
                    // Never drop data: degrade to the offline path
                    warn!(id = %emergency.id, %err, "remote create failed, queueing for retry");
                }
            }
        }

        let payload = serde_json::to_string(&CreateEmergencyPayload::from(&emergency))?;
        LibSqlPendingOperationRepository::new(self.db.connection())
            .enqueue(&OperationKind::CreateEmergency, &payload)
            .await?;

        // Queueing and broadcasting serve different failure modes; both may
        // fire for the same event
        let broadcast = reachability != Reachability::Offline;
        if broadcast {
            let frame = BroadcastFrame::from_emergency(&emergency);
            if let Err(err) = self.broadcaster.announce(&frame).await {
                debug!(%err, "best-effort broadcast failed");
            }
        }

        self.sink.on_emergency_created_locally(&emergency);
        info!(id = %emergency.id, broadcast, "emergency queued for sync");
        Ok(Submission {
            emergency,
            outcome: SubmitOutcome::Queued { broadcast },
        })
    }

    /// Attempt to accept an emergency on behalf of a volunteer.
    ///
    /// The server is the sole arbiter of the acceptance race: the local
    /// record is only marked accepted after the server confirms, and a
    /// `Conflict` is surfaced immediately so the volunteer stops acting
    /// on an already-handled emergency. While LAN-only or offline,
    /// acceptance cannot be durably arbitrated and fails `Unreachable`.
    pub async fn accept(&self, id: &EmergencyId, volunteer_id: i64) -> Result<Emergency> {
        let emergencies = LibSqlEmergencyRepository::new(self.db.connection());
        let emergency = emergencies
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if !emergency.status.can_transition_to(EmergencyStatus::Accepted) {
            return Err(Error::InvalidTransition(format!(
                "{} -> accepted",
                emergency.status
            )));
        }

        let Some(server_id) = emergency.server_id else {
            // Unreconciled record; there is nothing the server could
            // arbitrate against yet
            return Err(Error::Unreachable);
        };

        if self.oracle.classify() != Reachability::ServerReachable {
            return Err(Error::Unreachable);
        }

        self.remote
            .update_status(server_id, EmergencyStatus::Accepted, Some(volunteer_id))
            .await?;

        let accepted = emergencies
            .set_status(id, EmergencyStatus::Accepted, Some(volunteer_id))
            .await?;
        info!(id = %id, volunteer_id, "acceptance confirmed by server");
        Ok(accepted)
    }

    /// Complete or cancel an emergency.
    ///
    /// These transitions are single-writer, so no arbitration is needed:
    /// the local store is updated immediately and the server write is
    /// queued when it cannot be delivered.
    pub async fn resolve(
        &self,
        id: &EmergencyId,
        status: EmergencyStatus,
    ) -> Result<(Emergency, ResolveOutcome)> {
        if !status.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "resolve only handles terminal statuses, got {status}"
            )));
        }

        let emergencies = LibSqlEmergencyRepository::new(self.db.connection());
        let emergency = emergencies
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if !emergency.status.can_transition_to(status) {
            return Err(Error::InvalidTransition(format!(
                "{} -> {status}",
                emergency.status
            )));
        }

        let volunteer_id = match status {
            EmergencyStatus::Completed => emergency.volunteer_id,
            _ => None,
        };

        let Some(server_id) = emergency.server_id else {
            // Never confirmed by the server; the queued create still
            // replays the original snapshot as-is
            let updated = emergencies.set_status(id, status, volunteer_id).await?;
            return Ok((updated, ResolveOutcome::LocalOnly));
        };

        if self.oracle.classify() == Reachability::ServerReachable {
            match self
                .remote
                .update_status(server_id, status, volunteer_id)
                .await
            {
                Ok(()) => {
                    let updated = emergencies.set_status(id, status, volunteer_id).await?;
                    return Ok((updated, ResolveOutcome::Synced));
                }
                Err(err) if err.is_transient() => {
                    warn!(id = %id, %err, "remote status update failed, queueing");
                }
                Err(err) => return Err(err),
            }
        }

        let payload = serde_json::to_string(&UpdateStatusPayload {
            local_id: *id,
            server_id,
            status,
            volunteer_id,
        })?;
        LibSqlPendingOperationRepository::new(self.db.connection())
            .enqueue(&OperationKind::UpdateStatus, &payload)
            .await?;

        let updated = emergencies.set_status(id, status, volunteer_id).await?;
        Ok((updated, ResolveOutcome::Queued))
    }

    /// Drain the pending queue against the server, strictly FIFO.
    ///
    /// Invoked on connectivity-regained events or periodically. One
    /// failing item never blocks the rest; connectivity loss mid-walk
    /// halts with partial progress rather than failing every remaining
    /// item. Operations this binary cannot read are dropped.
    pub async fn sync_all(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        if self.oracle.classify() != Reachability::ServerReachable {
            report.stopped = Some(DrainStop::ConnectivityLost);
            self.sink.on_sync_batch_complete(&report);
            return Ok(report);
        }

        let queue = LibSqlPendingOperationRepository::new(self.db.connection());
        let pending = queue.list_fifo().await?;
        debug!(pending = pending.len(), "starting queue drain");

        for operation in &pending {
            if self.oracle.classify() != Reachability::ServerReachable {
                report.stopped = Some(DrainStop::ConnectivityLost);
                warn!(
                    remaining = pending.len() - report.succeeded - report.failed - report.skipped,
                    "connectivity lost mid-drain, halting"
                );
                break;
            }

            match self.replay(operation).await {
                Ok(Replay::Applied) => {
                    queue.delete(operation.id).await?;
                    report.succeeded += 1;
                }
                Ok(Replay::Dropped) => {
                    queue.delete(operation.id).await?;
                    report.skipped += 1;
                }
                Err(err) if err.is_transient() => {
                    // Stays at its queue position for the next drain pass
                    warn!(operation = operation.id, %err, "replay failed, keeping operation");
                    report.failed += 1;
                }
                Err(err) => return Err(err),
            }
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            halted = report.stopped.is_some(),
            "queue drain finished"
        );
        self.sink.on_sync_batch_complete(&report);
        Ok(report)
    }

    /// Replay one queued operation against the server
    async fn replay(&self, operation: &PendingOperation) -> Result<Replay> {
        match &operation.kind {
            OperationKind::CreateEmergency => {
                let Ok(payload) =
                    serde_json::from_str::<CreateEmergencyPayload>(&operation.payload)
                else {
                    warn!(
                        operation = operation.id,
                        "dropping undecodable create-emergency payload"
                    );
                    return Ok(Replay::Dropped);
                };

                let server_id = match self.remote.create_emergency(&payload.to_emergency()).await
                {
                    Ok(server_id) => server_id,
                    Err(err @ (Error::Conflict | Error::NotFound(_))) => {
                        // Permanent rejection; retrying would wedge the queue
                        warn!(operation = operation.id, %err, "server rejected queued create, dropping");
                        return Ok(Replay::Dropped);
                    }
                    Err(err) => return Err(err),
                };

                // Reconcile the local placeholder when the record still exists
                let emergencies = LibSqlEmergencyRepository::new(self.db.connection());
                if emergencies.get(&payload.local_id).await?.is_some() {
                    emergencies
                        .assign_server_id(&payload.local_id, server_id)
                        .await?;
                }
                Ok(Replay::Applied)
            }
            OperationKind::UpdateStatus => {
                let Ok(payload) = serde_json::from_str::<UpdateStatusPayload>(&operation.payload)
                else {
                    warn!(
                        operation = operation.id,
                        "dropping undecodable update-status payload"
                    );
                    return Ok(Replay::Dropped);
                };

                match self
                    .remote
                    .update_status(payload.server_id, payload.status, payload.volunteer_id)
                    .await
                {
                    Ok(()) => Ok(Replay::Applied),
                    Err(err @ (Error::Conflict | Error::NotFound(_))) => {
                        // Permanent rejection; retrying is meaningless
                        warn!(operation = operation.id, %err, "server rejected queued update, dropping");
                        Ok(Replay::Dropped)
                    }
                    Err(err) => Err(err),
                }
            }
            OperationKind::Unknown(tag) => {
                // Forward compatibility: prefer dropping unreadable legacy
                // entries over wedging the queue forever
                warn!(operation = operation.id, tag, "skipping unknown operation kind");
                Ok(Replay::Dropped)
            }
        }
    }

    /// Pull the server's active list and merge it into the local store.
    ///
    /// Lets a stale volunteer catch up after reconnecting.
    pub async fn refresh_active(&self, volunteer_id: Option<i64>) -> Result<Vec<Emergency>> {
        let records = self.remote.list_active(volunteer_id).await?;
        let emergencies = LibSqlEmergencyRepository::new(self.db.connection());

        let mut merged = Vec::with_capacity(records.len());
        for record in records {
            merged.push(emergencies.upsert_by_server_id(&record.to_emergency()).await?);
        }
        Ok(merged)
    }

    /// Record an emergency announced by a peer on the local segment.
    ///
    /// Receivers never trust a peer's acceptance state: every inbound
    /// broadcast is a fresh active candidate this device may later accept
    /// through the server-arbitrated path. Duplicates (same server id, or
    /// same origin and creation instant) are dropped.
    pub async fn handle_peer_broadcast(&self, frame: BroadcastFrame) -> Result<Option<Emergency>> {
        let emergencies = LibSqlEmergencyRepository::new(self.db.connection());

        if let Some(server_id) = frame.emergency_id {
            if emergencies.find_by_server_id(server_id).await?.is_some() {
                debug!(server_id, "ignoring duplicate peer broadcast");
                return Ok(None);
            }
        }
        if emergencies
            .find_duplicate(frame.elderly_id, frame.timestamp)
            .await?
            .is_some()
        {
            debug!(
                elderly_id = frame.elderly_id,
                "ignoring already-known peer broadcast"
            );
            return Ok(None);
        }

        let mut emergency = Emergency::new(frame.elderly_id, frame.latitude, frame.longitude);
        emergency.created_at = frame.timestamp;
        emergency.server_id = frame.emergency_id;
        emergency.status = EmergencyStatus::Active;

        emergencies.insert(&emergency).await?;
        self.sink.on_emergency_received_from_peer(&emergency);
        info!(id = %emergency.id, elderly_id = frame.elderly_id, "recorded peer emergency");
        Ok(Some(emergency))
    }

    /// Bridge a broadcast listener's frame channel into the coordinator
    pub fn attach_listener(
        self: &Arc<Self>,
        mut frames: mpsc::Receiver<BroadcastFrame>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if let Err(err) = coordinator.handle_peer_broadcast(frame).await {
                    warn!(%err, "failed to record peer emergency");
                }
            }
        })
    }

    /// Periodically drain the pending queue until the task is aborted
    pub fn spawn_drain_interval(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = coordinator.sync_all().await {
                    warn!(%err, "periodic drain failed");
                }
            }
        })
    }
}

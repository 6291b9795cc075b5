//! Dispatch/execute role: takes the most pressing request off the queue
//! and runs it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use super::request::{effective_timeout, Outgoing, QueuedRequest};
use super::{bump, Shared};
use crate::batch::{BatchKey, BatchMember};
use crate::collab::Outcome;
use crate::command::OpKind;
use crate::connection::Retained;
use crate::error::BatchError;
use crate::status::{Response, Status, StatusCode};
use crate::time;

/// Execute worker loop. Exits once the queue is closed and drained.
pub(crate) fn run(shared: Arc<Shared>) {
    while let Some(request) = shared.queue.dequeue() {
        dispatch(&shared, request);
        if shared.queue.is_empty() && shared.has_retained() {
            // nothing else to overlap with, so flush now
            shared.timer.fire_now();
        }
    }
    debug!("execute worker exiting");
}

fn dispatch(shared: &Shared, mut request: QueuedRequest) {
    let now = time::now_ms();
    request.timings.dequeued_ms = now;
    let conn = Arc::clone(&request.conn);

    if !conn.is_live() {
        conn.finish_command();
        return;
    }

    let op = request.command.op;
    let is_member = request.command.is_batch_member();

    // members ride on the batch's own deadline
    if !is_member && now > request.deadline_ms {
        bump(&shared.stats.requests_expired);
        shared.collab.observer.on_request_expired(op);
        debug!(conn_id = conn.id(), seq = request.command.sequence, %op, "request expired in queue");
        if op == OpKind::EndBatch {
            if let Some(batch_id) = request.command.batch_id {
                match shared.batches.abort(&BatchKey::new(conn.id(), batch_id)) {
                    Ok(()) => {
                        bump(&shared.stats.batches_aborted);
                        shared.collab.observer.on_batch_aborted();
                    }
                    Err(e) => {
                        debug!(conn_id = conn.id(), batch_id, error = %e, "expired batch already gone")
                    }
                }
            }
        }
        let status = Status::new(StatusCode::Expired, "Timeout Exceeded");
        finish(shared, request, Outcome::status(status), None);
        return;
    }

    if is_member {
        dispatch_member(shared, request);
        return;
    }

    if !request.admission.is_success() {
        let status = request.admission.clone();
        finish(shared, request, Outcome::status(status), None);
        return;
    }

    let (outcome, failed_sequence) = match op {
        OpKind::StartBatch => (Outcome::status(Status::success()), None),
        OpKind::EndBatch => commit_batch(shared, &request),
        OpKind::AbortBatch => (abort_batch(shared, &request), None),
        _ => {
            let outcome = shared
                .collab
                .processor
                .execute(&request.command, request.value.as_ref());
            bump(&shared.stats.commands_executed);
            (outcome, None)
        }
    };

    if request.command.wants_flush() && outcome.status.is_success() {
        bump(&shared.stats.flushes);
        shared.release_retained(&Status::success());
        if shared.batches.is_empty() {
            shared.timer.disarm();
        }
    }

    finish(shared, request, outcome, failed_sequence);
}

/// Adds a put or delete to its batch. Members only get a response when
/// the batch is gone.
fn dispatch_member(shared: &Shared, request: QueuedRequest) {
    let QueuedRequest {
        conn,
        command,
        value,
        admission,
        timings,
        ..
    } = request;
    let Some(batch_id) = command.batch_id else {
        conn.finish_command();
        return;
    };
    let key = BatchKey::new(conn.id(), batch_id);
    let sequence = command.sequence;
    let op = command.op;

    let result = shared.batches.add_member(
        &key,
        BatchMember {
            command,
            value,
            admission,
        },
    );
    match result {
        Ok(()) => conn.finish_command(),
        Err(e) => {
            let mut timings = timings;
            timings.processed_ms = time::now_ms();
            let response = Response::ack(sequence, e.status());
            shared.respond(Outgoing::reply(conn, response, op, timings), false);
        }
    }
}

fn commit_batch(shared: &Shared, request: &QueuedRequest) -> (Outcome, Option<u64>) {
    let conn_id = request.conn.id();
    let Some(batch_id) = request.command.batch_id else {
        return (Outcome::status(BatchError::NotFound.status()), None);
    };
    let key = BatchKey::new(conn_id, batch_id);

    if let Some(txn) = &request.batch {
        let left = time::remaining_ms(txn.deadline_ms(), time::now_ms()).max(0) as u64;
        let wait = left.min(shared.config.retain_ceiling_ms);
        if !txn.wait_for_members(Duration::from_millis(wait)) {
            debug!(conn_id, batch_id, "commit proceeding with members still outstanding");
        }
    }

    let collab = &shared.collab;
    let result = shared.batches.commit(
        &key,
        request.command.batch_count,
        collab.validator.as_ref(),
        collab.lifecycle.as_ref(),
        collab.storage.as_ref(),
    );
    match result {
        Ok(outcome) => {
            if outcome.status.is_success() {
                bump(&shared.stats.batches_committed);
                collab.observer.on_batch_committed(outcome.members);
            } else {
                error!(conn_id, batch_id, status = %outcome.status, "atomic write failed");
                bump(&shared.stats.batches_aborted);
                collab.observer.on_batch_aborted();
            }
            (Outcome::status(outcome.status), None)
        }
        Err(e) => {
            debug!(conn_id, batch_id, error = %e, "batch commit refused");
            bump(&shared.stats.batches_aborted);
            collab.observer.on_batch_aborted();
            (Outcome::status(e.status()), e.failed_sequence())
        }
    }
}

fn abort_batch(shared: &Shared, request: &QueuedRequest) -> Outcome {
    let Some(batch_id) = request.command.batch_id else {
        return Outcome::status(BatchError::NotFound.status());
    };
    if let Some(txn) = &request.batch {
        txn.wait_for_members(Duration::from_millis(shared.config.retain_ceiling_ms));
    }
    match shared.batches.abort(&BatchKey::new(request.conn.id(), batch_id)) {
        Ok(()) => {
            bump(&shared.stats.batches_aborted);
            shared.collab.observer.on_batch_aborted();
            Outcome::status(Status::success())
        }
        Err(e) => Outcome::status(e.status()),
    }
}

/// Builds the response and either retains it or hands it to the response
/// role.
fn finish(shared: &Shared, request: QueuedRequest, outcome: Outcome, failed_sequence: Option<u64>) {
    let QueuedRequest {
        conn,
        command,
        mut timings,
        batch,
        ..
    } = request;
    let now = time::now_ms();
    timings.processed_ms = now;

    let mut response = Response::ack(command.sequence, outcome.status)
        .with_value(outcome.value)
        .with_db_version(outcome.db_version);
    response.failed_sequence = failed_sequence;

    if !(command.wants_retain() && response.status.is_success()) {
        shared.respond(Outgoing::reply(conn, response, command.op, timings), false);
        return;
    }

    let cap = effective_timeout(command.timeout_ms, shared.config.default_timeout_ms)
        .min(shared.config.retain_ceiling_ms);
    let started = match (&batch, command.op) {
        (Some(txn), OpKind::EndBatch) => txn.created_ms(),
        _ => timings.enqueued_ms,
    };
    let elapsed = now.saturating_sub(started);
    let mut remaining = if elapsed <= cap {
        cap - elapsed
    } else {
        // late already: flush right away unless older work is waiting too
        let backlog_is_older = shared
            .queue
            .peek_top()
            .is_some_and(|top| now.saturating_sub(top.enqueued_ms) > cap);
        if backlog_is_older {
            cap
        } else {
            0
        }
    };

    let held = conn.retain(Retained {
        response,
        op: command.op,
        timings,
    });
    bump(&shared.stats.responses_retained);
    shared.stats.retained_held.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    shared.collab.observer.on_response_retained();
    if !conn.is_live() {
        // closed while executing; nobody left to acknowledge
        shared.forget_retained(conn.take_pending().len());
        conn.finish_command();
        return;
    }
    if held >= shared.config.limits.max_pending_status {
        remaining = 0;
    }

    if remaining == 0 {
        shared.timer.fire_now();
    } else {
        shared.timer.arm(remaining);
    }
}

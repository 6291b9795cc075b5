//! Response role: sends finished work back to its connection.

use std::sync::Arc;

use tracing::{debug, warn};

use super::request::Outgoing;
use super::{bump, Shared};
use crate::connection::ConnectionState;
use crate::status::{Status, StatusCode};
use crate::time;

/// Response worker loop. Exits once the response queue is shut down and
/// drained.
pub(crate) fn run(shared: Arc<Shared>) {
    while let Some(out) = shared.responses.dequeue() {
        deliver(&shared, out);
    }
    debug!("response worker exiting");
}

fn deliver(shared: &Shared, out: Outgoing) {
    let Outgoing {
        conn,
        mut response,
        op,
        mut timings,
        in_flight,
        close_after,
    } = out;

    if conn.state() == ConnectionState::Closed {
        return;
    }

    let max = shared.config.limits.max_message_size;
    if conn.sink().encoded_len(&response) > max {
        warn!(
            conn_id = conn.id(),
            seq = ?response.ack_sequence,
            "response exceeds message size limit, replacing"
        );
        bump(&shared.stats.responses_oversize);
        response.status = Status::new(StatusCode::InternalError, "Response too large");
        response.value = None;
        response.db_version = None;
    }

    let sequence = response.ack_sequence;
    let status = response.status.clone();
    timings.responded_ms = time::now_ms();

    match conn.sink().send(response) {
        Ok(()) => bump(&shared.stats.responses_sent),
        Err(e) => {
            bump(&shared.stats.send_failures);
            conn.mark_should_close();
            shared.close_connection(conn.id(), &format!("send failed: {e}"));
            return;
        }
    }

    if in_flight {
        conn.finish_command();
        shared.latency.maybe_record(conn.id(), sequence, op, timings);
        let total_us = timings.total_ms().saturating_mul(1000);
        shared.collab.observer.on_command_complete(op, &status, total_us);
    }

    if close_after {
        shared.close_connection(conn.id(), "closed after final status");
    }
}

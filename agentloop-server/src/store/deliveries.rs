//! Delivery records: webhook deduplication and atomic job creation.
//!
//! A delivery and the job it produces commit in one transaction. The
//! `INSERT OR IGNORE` + `changes()` pattern decides the race between
//! concurrent redeliveries without a read-then-insert window.

use rusqlite::{params, Connection, TransactionBehavior};

use super::jobs::insert_job_sync;
use super::{sql, u64_to_i64, Store};
use crate::error::StoreError;
use crate::queue::{JobKind, JobSpec};

/// An inbound webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_id: String,
    pub event_type: String,
    pub received_at: i64,
}

/// What recording a delivery did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// New delivery; this job was created for it.
    Enqueued { job_id: i64 },
    /// New delivery that maps to no job.
    Recorded,
    /// New delivery for an issue that already has a code-gen job in flight.
    AlreadyQueued { job_id: i64 },
    /// The delivery id was seen before. Nothing changed.
    Duplicate,
}

/// A pending or leased code-gen job for the same issue, if any.
fn active_code_gen_sync(conn: &Connection, spec: &JobSpec) -> Result<Option<i64>, StoreError> {
    let Some(issue_number) = spec.issue_number() else {
        return Ok(None);
    };
    let issue_number = u64_to_i64(issue_number, "record_delivery")?;

    let mut stmt = conn
        .prepare(
            "SELECT job_id FROM jobs
             WHERE kind = ?1 AND repo = ?2 AND issue_number = ?3
               AND status IN ('pending', 'leased')
             ORDER BY job_id
             LIMIT 1",
        )
        .map_err(sql("record_delivery"))?;
    let mut rows = stmt
        .query(params![
            JobKind::CodeGen.as_str(),
            spec.repo().full_name(),
            issue_number
        ])
        .map_err(sql("record_delivery"))?;

    match rows.next().map_err(sql("record_delivery"))? {
        Some(row) => Ok(Some(row.get(0).map_err(sql("record_delivery"))?)),
        None => Ok(None),
    }
}

fn record_delivery_sync(
    conn: &mut Connection,
    delivery: &Delivery,
    spec: Option<&JobSpec>,
) -> Result<DeliveryOutcome, StoreError> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(sql("record_delivery"))?;

    tx.execute(
        "INSERT OR IGNORE INTO deliveries (delivery_id, event_type, received_at) VALUES (?1, ?2, ?3)",
        params![delivery.delivery_id, delivery.event_type, delivery.received_at],
    )
    .map_err(sql("record_delivery"))?;

    if tx.changes() == 0 {
        return Ok(DeliveryOutcome::Duplicate);
    }

    let outcome = match spec {
        None => DeliveryOutcome::Recorded,
        Some(spec) if spec.kind() == JobKind::CodeGen => match active_code_gen_sync(&tx, spec)? {
            Some(job_id) => DeliveryOutcome::AlreadyQueued { job_id },
            None => DeliveryOutcome::Enqueued {
                job_id: insert_job_sync(
                    &tx,
                    spec,
                    Some(&delivery.delivery_id),
                    delivery.received_at,
                )?,
            },
        },
        Some(spec) => DeliveryOutcome::Enqueued {
            job_id: insert_job_sync(&tx, spec, Some(&delivery.delivery_id), delivery.received_at)?,
        },
    };

    tx.commit().map_err(sql("record_delivery"))?;
    Ok(outcome)
}

impl Store {
    /// Record a delivery and, when it is new and maps to work, its job.
    pub async fn record_delivery(
        &self,
        delivery: Delivery,
        spec: Option<JobSpec>,
    ) -> Result<DeliveryOutcome, StoreError> {
        self.blocking("record_delivery", move |conn| {
            record_delivery_sync(conn, &delivery, spec.as_ref())
        })
        .await
    }

    /// Delete delivery records and PR timeline rows older than `cutoff`.
    /// Jobs keep their rows; their `delivery_id` is cleared by the foreign key.
    pub async fn prune_before(&self, cutoff: i64) -> Result<usize, StoreError> {
        self.blocking("prune", move |conn| {
            let deliveries = conn
                .execute("DELETE FROM deliveries WHERE received_at < ?1", params![cutoff])
                .map_err(sql("prune deliveries"))?;
            let events = conn
                .execute("DELETE FROM pr_events WHERE recorded_at < ?1", params![cutoff])
                .map_err(sql("prune pr_events"))?;
            Ok(deliveries + events)
        })
        .await
    }
}

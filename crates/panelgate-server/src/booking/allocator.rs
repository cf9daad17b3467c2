//! Booking allocator: reservations of the shared capacity pool.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqliteConnection;
use tracing::{info, instrument};

use super::sweep::{Interval, Resources, Violation, first_violation};
use crate::audit::{AuditSink, NullAudit, attempt};
use crate::auth::Principal;
use crate::error::{Error, Result};
use crate::storage::queries_bookings::{
    find_booking, insert_booking, lock_capacity, overlapping_bookings, update_booking_slot,
};
use crate::storage::{Booking, BookingSlot, NewOperationLog, PanelDatabase};

/// A reservation as requested by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub start_time: i64,
    pub end_time: i64,
    pub cpu_cores: i64,
    pub ram_gb: i64,
    #[serde(default)]
    pub gpu_ram_gb: i64,
    #[serde(default)]
    pub description: String,
}

impl BookingRequest {
    const fn demand(&self) -> Resources {
        Resources {
            cpu_cores: self.cpu_cores,
            ram_gb: self.ram_gb,
            gpu_ram_gb: self.gpu_ram_gb,
        }
    }

    fn into_slot(self) -> BookingSlot {
        BookingSlot {
            start_time: self.start_time,
            end_time: self.end_time,
            cpu_cores: self.cpu_cores,
            ram_gb: self.ram_gb,
            gpu_ram_gb: self.gpu_ram_gb,
            description: self.description,
        }
    }
}

/// A request that passed validation against the bookings visible when it
/// was proposed. Capacity is checked again on commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedBooking {
    user_id: String,
    request: BookingRequest,
}

impl ValidatedBooking {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub const fn request(&self) -> &BookingRequest {
        &self.request
    }
}

#[derive(Clone)]
pub struct BookingAllocator {
    db: PanelDatabase,
    capacity: Resources,
    audit: Arc<dyn AuditSink>,
}

impl BookingAllocator {
    pub fn new(db: PanelDatabase, capacity: Resources) -> Self {
        Self {
            db,
            capacity,
            audit: Arc::new(NullAudit),
        }
    }

    /// Record commits, updates and cancellations in `audit`.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub const fn capacity(&self) -> Resources {
        self.capacity
    }

    /// Validate a reservation without storing it.
    pub async fn propose(&self, user_id: &str, request: BookingRequest) -> Result<ValidatedBooking> {
        Self::check_shape(&request)?;
        let mut conn = self.db.acquire().await?;
        self.check_capacity(&mut conn, &request, None).await?;
        Ok(ValidatedBooking {
            user_id: user_id.to_string(),
            request,
        })
    }

    /// Re-validate under the capacity lock and insert.
    pub async fn commit(&self, validated: ValidatedBooking) -> Result<Booking> {
        let user_id = validated.user_id.clone();
        let params = serde_json::to_string(&validated.request).ok();
        let result = self.insert_validated(validated).await;
        self.record(&user_id, "commit", params, &result);
        result
    }

    /// Propose and commit in one call.
    pub async fn book(&self, user_id: &str, request: BookingRequest) -> Result<Booking> {
        let params = serde_json::to_string(&request).ok();
        let result = async {
            let validated = self.propose(user_id, request).await?;
            self.insert_validated(validated).await
        }
        .await;
        self.record(user_id, "book", params, &result);
        result
    }

    #[instrument(skip(self, validated), fields(user_id = %validated.user_id))]
    async fn insert_validated(&self, validated: ValidatedBooking) -> Result<Booking> {
        let mut tx = self.db.begin().await?;
        lock_capacity(&mut tx).await?;
        self.check_capacity(&mut tx, &validated.request, None).await?;
        let booking = insert_booking(&mut tx, &validated.user_id, &validated.request.into_slot()).await?;
        tx.commit().await?;

        info!(
            booking_id = booking.id,
            start = booking.start_time,
            end = booking.end_time,
            "Booking committed"
        );
        Ok(booking)
    }

    /// Replace a booking's window and demand. The booking itself is left out
    /// of the capacity check.
    pub async fn update(&self, actor: &Principal, id: i64, request: BookingRequest) -> Result<Booking> {
        let params = json!({ "booking_id": id, "request": &request }).to_string();
        let result = self.replace(actor, id, request).await;
        self.record(&actor.user_id, "update", Some(params), &result);
        result
    }

    #[instrument(skip(self, actor, request), fields(actor = %actor.user_id))]
    async fn replace(&self, actor: &Principal, id: i64, request: BookingRequest) -> Result<Booking> {
        Self::check_shape(&request)?;

        let mut tx = self.db.begin().await?;
        lock_capacity(&mut tx).await?;
        let existing = find_booking(&mut tx, id).await?;
        if !actor.owns_or_admin(&existing.user_id) {
            return Err(Error::Forbidden(format!("booking {id} belongs to another user")));
        }
        self.check_capacity(&mut tx, &request, Some(id)).await?;
        let booking = update_booking_slot(&mut tx, id, &request.into_slot()).await?;
        tx.commit().await?;

        info!(booking_id = id, "Booking updated");
        Ok(booking)
    }

    /// Delete a booking. Owner or admin only.
    pub async fn cancel(&self, id: i64, actor: &Principal) -> Result<()> {
        let result = self.delete(id, actor).await;
        let params = json!({ "booking_id": id }).to_string();
        self.record(&actor.user_id, "cancel", Some(params), &result);
        result
    }

    async fn delete(&self, id: i64, actor: &Principal) -> Result<()> {
        let booking = self.db.get_booking(id).await?;
        if !actor.owns_or_admin(&booking.user_id) {
            return Err(Error::Forbidden(format!("booking {id} belongs to another user")));
        }
        if !self.db.delete_booking(id).await? {
            return Err(Error::NotFound(format!("Booking {id}")));
        }
        info!(booking_id = id, actor = %actor.user_id, "Booking cancelled");
        Ok(())
    }

    pub async fn get(&self, actor: &Principal, id: i64) -> Result<Booking> {
        let booking = self.db.get_booking(id).await?;
        if !actor.owns_or_admin(&booking.user_id) {
            return Err(Error::Forbidden(format!("booking {id} belongs to another user")));
        }
        Ok(booking)
    }

    /// Administrators see every booking, users their own.
    pub async fn list(&self, actor: &Principal) -> Result<Vec<Booking>> {
        let filter = (!actor.role.is_admin()).then_some(actor.user_id.as_str());
        Ok(self.db.list_bookings(filter).await?)
    }

    fn record<T>(&self, user_id: &str, method: &str, params: Option<String>, result: &Result<T>) {
        self.audit.append(NewOperationLog {
            params,
            ..attempt(Some(user_id), "bookings", method, result)
        });
    }

    fn check_shape(request: &BookingRequest) -> Result<()> {
        if request.start_time >= request.end_time {
            return Err(Error::Validation("start time must be before end time".into()));
        }
        if request.cpu_cores <= 0 || request.ram_gb <= 0 {
            return Err(Error::Validation("cpu_cores and ram_gb must be positive".into()));
        }
        if request.gpu_ram_gb < 0 {
            return Err(Error::Validation("gpu_ram_gb must not be negative".into()));
        }
        Ok(())
    }

    async fn check_capacity(
        &self,
        conn: &mut SqliteConnection,
        request: &BookingRequest,
        exclude_id: Option<i64>,
    ) -> Result<()> {
        let existing =
            overlapping_bookings(conn, request.start_time, request.end_time, exclude_id).await?;
        let intervals = existing.iter().map(|b| Interval {
            start: b.start_time,
            end: b.end_time,
            demand: Resources {
                cpu_cores: b.cpu_cores,
                ram_gb: b.ram_gb,
                gpu_ram_gb: b.gpu_ram_gb,
            },
        });

        match first_violation(
            self.capacity,
            request.start_time,
            request.end_time,
            request.demand(),
            intervals,
        ) {
            None => Ok(()),
            Some(Violation {
                dimension,
                at,
                requested,
                capacity,
            }) => Err(Error::CapacityExceeded {
                dimension,
                at,
                requested,
                capacity,
            }),
        }
    }
}

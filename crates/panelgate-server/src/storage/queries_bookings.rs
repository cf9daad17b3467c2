//! Booking queries.

use panelgate_core::db::unix_timestamp;
use sqlx::SqliteConnection;

use super::db::{DatabaseError, PanelDatabase};
use super::models::{Booking, BookingSlot};

/// Bump the capacity guard row. Issued as the first statement of a
/// transaction it acquires the database write lock, so concurrent
/// check-then-insert sequences run one after another.
pub async fn lock_capacity(conn: &mut SqliteConnection) -> Result<(), DatabaseError> {
    sqlx::query("UPDATE capacity_guard SET generation = generation + 1 WHERE id = 1")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Bookings intersecting the half-open window `[start, end)`.
pub async fn overlapping_bookings(
    conn: &mut SqliteConnection,
    start: i64,
    end: i64,
    exclude_id: Option<i64>,
) -> Result<Vec<Booking>, DatabaseError> {
    let rows = sqlx::query_as::<_, Booking>(
        "SELECT * FROM bookings
         WHERE start_time < ? AND end_time > ? AND (? IS NULL OR id != ?)
         ORDER BY start_time, id",
    )
    .bind(end)
    .bind(start)
    .bind(exclude_id)
    .bind(exclude_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

pub async fn insert_booking(
    conn: &mut SqliteConnection,
    user_id: &str,
    slot: &BookingSlot,
) -> Result<Booking, DatabaseError> {
    let now = unix_timestamp();
    let booking = sqlx::query_as::<_, Booking>(
        "INSERT INTO bookings (user_id, start_time, end_time, cpu_cores, ram_gb, gpu_ram_gb, description, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(user_id)
    .bind(slot.start_time)
    .bind(slot.end_time)
    .bind(slot.cpu_cores)
    .bind(slot.ram_gb)
    .bind(slot.gpu_ram_gb)
    .bind(&slot.description)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(booking)
}

pub async fn update_booking_slot(
    conn: &mut SqliteConnection,
    id: i64,
    slot: &BookingSlot,
) -> Result<Booking, DatabaseError> {
    sqlx::query_as::<_, Booking>(
        "UPDATE bookings SET start_time = ?, end_time = ?, cpu_cores = ?, ram_gb = ?, gpu_ram_gb = ?,
                description = ?, updated_at = ?
         WHERE id = ? RETURNING *",
    )
    .bind(slot.start_time)
    .bind(slot.end_time)
    .bind(slot.cpu_cores)
    .bind(slot.ram_gb)
    .bind(slot.gpu_ram_gb)
    .bind(&slot.description)
    .bind(unix_timestamp())
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| DatabaseError::NotFound(format!("Booking {id}")))
}

pub async fn find_booking(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Booking, DatabaseError> {
    sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Booking {id}")))
}

impl PanelDatabase {
    pub async fn get_booking(&self, id: i64) -> Result<Booking, DatabaseError> {
        let mut conn = self.acquire().await?;
        find_booking(&mut conn, id).await
    }

    /// All bookings, or only those of `user_id`, latest start first.
    pub async fn list_bookings(&self, user_id: Option<&str>) -> Result<Vec<Booking>, DatabaseError> {
        let rows = sqlx::query_as::<_, Booking>(
            "SELECT * FROM bookings WHERE (? IS NULL OR user_id = ?) ORDER BY start_time DESC, id DESC",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn delete_booking(&self, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM bookings WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

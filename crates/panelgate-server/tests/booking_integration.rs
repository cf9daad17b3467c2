#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Integration tests for the booking allocator against a real database.

use panelgate_server::Error;
use panelgate_server::auth::Principal;
use panelgate_server::booking::{BookingAllocator, BookingRequest, Resources};
use panelgate_server::error::ResourceDimension;
use panelgate_server::storage::{NewUser, PanelDatabase, Role};

const HOUR: i64 = 3600;

const CAPACITY: Resources = Resources {
    cpu_cores: 16,
    ram_gb: 64,
    gpu_ram_gb: 24,
};

fn request(start_hour: i64, end_hour: i64, cpu_cores: i64) -> BookingRequest {
    BookingRequest {
        start_time: start_hour * HOUR,
        end_time: end_hour * HOUR,
        cpu_cores,
        ram_gb: 8,
        gpu_ram_gb: 0,
        description: String::new(),
    }
}

async fn user(db: &PanelDatabase, name: &str) -> Principal {
    let user = db
        .create_user(&NewUser {
            email: &format!("{name}@example.com"),
            server_username: name,
            name,
            password_hash: "hash",
            role: Role::User,
        })
        .await
        .unwrap();
    Principal::new(user.id, Role::User)
}

#[tokio::test]
async fn overlapping_booking_over_capacity_is_rejected_at_first_instant() {
    let db = PanelDatabase::open_in_memory().await.unwrap();
    let allocator = BookingAllocator::new(db.clone(), CAPACITY);
    let alice = user(&db, "alice").await;
    let bob = user(&db, "bob").await;

    allocator
        .book(&alice.user_id, request(10, 12, 10))
        .await
        .unwrap();

    let err = allocator
        .book(&bob.user_id, request(11, 13, 8))
        .await
        .unwrap_err();
    let Error::CapacityExceeded {
        dimension,
        at,
        requested,
        capacity,
    } = err
    else {
        panic!("expected CapacityExceeded, got {err:?}");
    };
    assert_eq!(dimension, ResourceDimension::Cpu);
    assert_eq!(at, 11 * HOUR);
    assert_eq!(requested, 18);
    assert_eq!(capacity, 16);

    allocator
        .book(&bob.user_id, request(11, 13, 6))
        .await
        .unwrap();
    assert_eq!(db.list_bookings(None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn back_to_back_bookings_share_capacity() {
    let db = PanelDatabase::open_in_memory().await.unwrap();
    let allocator = BookingAllocator::new(db.clone(), CAPACITY);
    let alice = user(&db, "alice").await;

    allocator.book(&alice.user_id, request(8, 10, 16)).await.unwrap();
    allocator.book(&alice.user_id, request(10, 12, 16)).await.unwrap();
}

#[tokio::test]
async fn malformed_requests_are_validation_errors() {
    let db = PanelDatabase::open_in_memory().await.unwrap();
    let allocator = BookingAllocator::new(db.clone(), CAPACITY);
    let alice = user(&db, "alice").await;

    for bad in [
        request(12, 12, 4),
        request(13, 12, 4),
        request(10, 12, 0),
        BookingRequest {
            gpu_ram_gb: -1,
            ..request(10, 12, 4)
        },
    ] {
        assert!(matches!(
            allocator.book(&alice.user_id, bad).await,
            Err(Error::Validation(_))
        ));
    }
}

#[tokio::test]
async fn proposals_validated_together_commit_at_most_once() {
    let dir = tempfile::tempdir().unwrap();
    let db = PanelDatabase::open(&dir.path().join("panel.db")).await.unwrap();
    let allocator = BookingAllocator::new(db.clone(), CAPACITY);
    let alice = user(&db, "alice").await;
    let bob = user(&db, "bob").await;

    // Each fits on its own; together they need 20 cores.
    let first = allocator
        .propose(&alice.user_id, request(9, 11, 10))
        .await
        .unwrap();
    let second = allocator
        .propose(&bob.user_id, request(10, 12, 10))
        .await
        .unwrap();

    let a = allocator.clone();
    let b = allocator.clone();
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move { a.commit(first).await }),
        tokio::spawn(async move { b.commit(second).await }),
    );
    let results = [r1.unwrap(), r2.unwrap()];

    let committed = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(committed, 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(Error::CapacityExceeded { .. })))
    );
    assert_eq!(db.list_bookings(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn update_excludes_the_booking_itself() {
    let db = PanelDatabase::open_in_memory().await.unwrap();
    let allocator = BookingAllocator::new(db.clone(), CAPACITY);
    let alice = user(&db, "alice").await;

    let booking = allocator
        .book(&alice.user_id, request(10, 12, 12))
        .await
        .unwrap();

    // Growing in place only counts the new demand.
    let updated = allocator
        .update(&alice, booking.id, request(10, 13, 16))
        .await
        .unwrap();
    assert_eq!(updated.cpu_cores, 16);
    assert_eq!(updated.end_time, 13 * HOUR);

    assert!(matches!(
        allocator.update(&alice, booking.id, request(10, 13, 17)).await,
        Err(Error::CapacityExceeded { .. })
    ));
}

#[tokio::test]
async fn only_owner_or_admin_may_touch_a_booking() {
    let db = PanelDatabase::open_in_memory().await.unwrap();
    let allocator = BookingAllocator::new(db.clone(), CAPACITY);
    let alice = user(&db, "alice").await;
    let mallory = user(&db, "mallory").await;
    let admin = Principal::new("root", Role::Admin);

    let booking = allocator
        .book(&alice.user_id, request(10, 12, 4))
        .await
        .unwrap();

    assert!(matches!(
        allocator.cancel(booking.id, &mallory).await,
        Err(Error::Forbidden(_))
    ));
    assert!(matches!(
        allocator.update(&mallory, booking.id, request(10, 12, 2)).await,
        Err(Error::Forbidden(_))
    ));
    assert!(matches!(
        allocator.get(&mallory, booking.id).await,
        Err(Error::Forbidden(_))
    ));
    assert!(allocator.list(&mallory).await.unwrap().is_empty());
    assert_eq!(allocator.list(&admin).await.unwrap().len(), 1);

    allocator.cancel(booking.id, &admin).await.unwrap();
    assert!(matches!(
        allocator.get(&alice, booking.id).await,
        Err(Error::NotFound(_))
    ));
}

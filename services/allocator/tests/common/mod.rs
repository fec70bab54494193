//! Shared fixtures for engine and job tests.
//!
//! Everything runs against `MemoryStore` and a `ManualClock`, so a test reads
//! like a timeline: seed the pool, submit requests, move the clock, tick jobs.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use spindit_allocator::calendar::{MonthDay, SchoolYear};
use spindit_allocator::clock::ManualClock;
use spindit_allocator::engine::{
    dispatch, AllocationOutcome, DispatchOutcome, EngineConfig, EngineContext, RenewalConfig,
};
use spindit_allocator::jobs::{Job, TickReport};
use spindit_allocator::model::{Locker, Notification, NotificationTemplate, Request};
use spindit_allocator::store::MemoryStore;
use spindit_events::{LifecycleEvent, RequestStatus};
use spindit_id::{RequestId, UserId};

pub const HOLD_HOURS: i64 = 48;

/// 2025-03-10 08:00 UTC, in the middle of school year 2024/25.
pub fn start() -> DateTime<Utc> {
    at(2025, 3, 10, 8)
}

pub fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub fn current_year() -> SchoolYear {
    SchoolYear::starting(2024)
}

pub fn renewal_config() -> RenewalConfig {
    RenewalConfig {
        open_date: MonthDay::new(6, 1).unwrap(),
        cycle_start: MonthDay::new(8, 1).unwrap(),
        deadline_offset: Duration::days(14),
        reminder_lead: None,
    }
}

pub fn engine_config() -> EngineConfig {
    EngineConfig::new(Duration::hours(HOLD_HOURS), renewal_config())
}

pub struct Harness {
    pub store: MemoryStore,
    pub clock: Arc<ManualClock>,
    pub ctx: EngineContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(engine_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(start()));
        let ctx = EngineContext::new(Arc::new(store.clone()), clock.clone(), config);
        Self { store, clock, ctx }
    }

    /// A pending request for the current school year, not yet stored.
    pub fn request(&self) -> Request {
        Request::new(UserId::new(), current_year(), self.clock_now())
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.ctx.now()
    }

    /// Stores the request and delivers its `RequestCreated` event.
    pub async fn submit(&self, request: Request) -> (RequestId, AllocationOutcome) {
        let request = self.store.insert_request(request);
        let outcome = dispatch(
            &self.ctx,
            &LifecycleEvent::RequestCreated {
                request_id: request.id,
            },
        )
        .await
        .unwrap();
        match outcome {
            DispatchOutcome::Allocation(outcome) => (request.id, outcome),
            other => panic!("creation dispatched to {other:?}"),
        }
    }

    /// Changes the request's status the way a user or staff member would, then
    /// delivers the resulting event.
    pub async fn change_status(&self, id: RequestId, to: RequestStatus) -> DispatchOutcome {
        let from = self
            .store
            .set_request_status(id, to)
            .expect("request exists");
        dispatch(
            &self.ctx,
            &LifecycleEvent::RequestStatusChanged {
                request_id: id,
                from: Some(from),
                to,
            },
        )
        .await
        .unwrap()
    }

    /// Submits and confirms a request, leaving its locker occupied.
    pub async fn assigned(&self, request: Request) -> (RequestId, Locker) {
        let (id, outcome) = self.submit(request).await;
        let locker = outcome.locker().cloned().expect("locker allocated");
        self.change_status(id, RequestStatus::Assigned).await;
        (id, locker)
    }

    pub async fn tick(&self, job: &dyn Job) -> TickReport {
        job.tick(&self.ctx).await.unwrap()
    }

    pub fn notifications_of(&self, template: NotificationTemplate) -> Vec<Notification> {
        self.store
            .notifications()
            .into_iter()
            .filter(|n| n.template == template)
            .collect()
    }
}

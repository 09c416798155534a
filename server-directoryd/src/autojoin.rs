//! Join a server as soon as it has room for us.
//!
//! A monitor is armed by the user and disarms itself after one decision:
//! it either fires the join or gives up when availability goes away. It
//! never re-arms on its own.

use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use shared::record::{Property, PropertySet};
use shared::types::{ServerId, ServerRecord, Status};
use crate::directory::DirectoryEvent;
use crate::manager::DirectoryManager;

/// Record properties the monitor reacts to.
pub const RELEVANT: PropertySet = PropertySet::of(&[
    Property::Status,
    Property::CurrentDrivers,
    Property::Capacity,
    Property::Cars,
    Property::Booking,
    Property::Selection,
]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoJoinAction {
    Idle,
    /// `car` is `None` when the join should use the record's own choice.
    Join { car: Option<String> },
    Disarmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoJoinMonitor {
    active: bool,
    any_car_mode: bool,
    was_available: bool,
}

impl AutoJoinMonitor {
    pub fn arm(any_car_mode: bool) -> Self {
        Self {
            active: true,
            any_car_mode,
            was_available: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn disarm(&mut self) {
        self.active = false;
    }

    /// Re-evaluate after the record changed.
    pub fn on_change(&mut self, record: &ServerRecord, now: DateTime<Utc>) -> AutoJoinAction {
        if !self.active {
            return AutoJoinAction::Idle;
        }
        // No fresh information while a probe is running
        if matches!(record.status, Status::Unloaded | Status::Loading) {
            return AutoJoinAction::Idle;
        }

        let car = self.matching_car(record);
        let available = record.status == Status::Ready && car.is_some();

        if available && booking_over(record, now) {
            self.active = false;
            return AutoJoinAction::Join { car: car.flatten() };
        }
        if self.was_available && !available {
            self.active = false;
            return AutoJoinAction::Disarmed;
        }
        self.was_available = available;
        AutoJoinAction::Idle
    }

    /// `Some(car)` when there is room for us. The inner value is the car to
    /// pick, `None` to leave the choice to the join.
    fn matching_car(&self, record: &ServerRecord) -> Option<Option<String>> {
        let live = &record.live;
        if let Some(booking) = &record.booking {
            // The booked slot is ours while the car is still offered
            return live
                .cars
                .iter()
                .any(|car| car.id == booking.car_id)
                .then(|| Some(booking.car_id.clone()));
        }
        if record.is_full() {
            return None;
        }

        let has_room = |id: &str| live.cars.iter().any(|car| car.id == id && car.free_slots() > 0);
        match &record.selected_car {
            Some(fixed) if has_room(fixed.as_str()) => Some(Some(fixed.clone())),
            Some(_) if !self.any_car_mode => None,
            None if !self.any_car_mode => Some(None),
            _ => live
                .cars
                .iter()
                .find(|car| car.free_slots() > 0)
                .map(|car| Some(car.id.clone())),
        }
    }
}

/// Unbooked records can be joined at any time; booked ones once the
/// booking period is over.
fn booking_over(record: &ServerRecord, now: DateTime<Utc>) -> bool {
    record
        .booking_time_left(now)
        .map_or(true, |left| left <= chrono::Duration::zero())
}

/// Drive one monitor from the directory's change events until it fires,
/// disarms, the record disappears or `cancel` is triggered.
pub async fn run_session(
    manager: &DirectoryManager,
    id: &ServerId,
    any_car: bool,
    password: Option<String>,
    cancel: &CancellationToken,
) {
    let mut events = manager.directory().subscribe();
    let mut monitor = AutoJoinMonitor::arm(any_car);
    // Booking expiry is not an event, so re-check on a timer too
    let mut recheck = tokio::time::interval(Duration::from_secs(1));
    manager.watch(id).await;
    tracing::info!("Auto-join armed for {} (any car: {})", id, any_car);

    let action = loop {
        if !monitor.is_active() {
            break AutoJoinAction::Disarmed;
        }
        let record = match manager.directory().get(id.clone()).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::info!("Auto-join target {} is gone", id);
                break AutoJoinAction::Disarmed;
            }
            Err(e) => {
                tracing::warn!("Auto-join for {} stopped: {}", id, e);
                break AutoJoinAction::Disarmed;
            }
        };
        match monitor.on_change(&record, Utc::now()) {
            AutoJoinAction::Idle => {}
            action => break action,
        }

        let wake = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break false,
                _ = recheck.tick() => break true,
                event = events.recv() => match event {
                    Ok(DirectoryEvent::Changed { id: changed, properties })
                        if changed == *id && properties.intersects(RELEVANT) => break true,
                    Ok(DirectoryEvent::Removed(ids)) if ids.contains(id) => break true,
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => break true,
                    Err(RecvError::Closed) => break false,
                },
            }
        };
        if !wake {
            monitor.disarm();
        }
    };

    manager.unwatch(id).await;
    match action {
        AutoJoinAction::Join { car } => {
            tracing::info!("Auto-join firing for {}", id);
            match manager.join(id, car, password).await {
                Ok(outcome) => tracing::info!("Auto-join on {} finished: {:?}", id, outcome),
                Err(e) => tracing::warn!("Auto-join on {} failed: {}", id, e),
            }
        }
        _ => tracing::info!("Auto-join disarmed for {}", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::{Booking, CarEntry, SourceKind, UpdateMode};
    use crate::testing::{sample_report, test_addr, TestRig};

    fn record(current: u32, capacity: u32) -> ServerRecord {
        let mut r = ServerRecord::new("10.0.0.1:9600".parse().unwrap(), None, SourceKind::Master);
        r.status = Status::Ready;
        r.live.current_drivers = current;
        r.live.capacity = capacity;
        r.live.cars = vec![
            CarEntry { id: "ks_porsche_911_gt3_r".to_string(), total: 5, used: Some(5) },
            CarEntry { id: "ks_audi_r8_lms".to_string(), total: 5, used: Some(current.saturating_sub(5)) },
        ];
        r
    }

    #[test]
    fn test_fires_exactly_once_when_slot_opens() {
        let mut monitor = AutoJoinMonitor::arm(false);
        let now = Utc::now();
        let full = record(10, 10);
        let mut loading = full.clone();
        loading.status = Status::Loading;

        assert_eq!(monitor.on_change(&full, now), AutoJoinAction::Idle);
        assert_eq!(monitor.on_change(&loading, now), AutoJoinAction::Idle);
        assert_eq!(monitor.on_change(&full, now), AutoJoinAction::Idle);
        assert!(monitor.is_active());

        assert_eq!(monitor.on_change(&record(9, 10), now), AutoJoinAction::Join { car: None });
        assert!(!monitor.is_active());
        assert_eq!(monitor.on_change(&record(8, 10), now), AutoJoinAction::Idle);
    }

    #[test]
    fn test_any_car_mode_picks_free_car() {
        let mut monitor = AutoJoinMonitor::arm(true);
        let mut r = record(7, 10);
        r.selected_car = Some("ks_porsche_911_gt3_r".to_string());
        assert_eq!(
            monitor.on_change(&r, Utc::now()),
            AutoJoinAction::Join { car: Some("ks_audi_r8_lms".to_string()) }
        );
    }

    #[test]
    fn test_fixed_car_waits_for_its_own_slot() {
        let mut monitor = AutoJoinMonitor::arm(false);
        let mut r = record(7, 10);
        r.selected_car = Some("ks_porsche_911_gt3_r".to_string());
        assert_eq!(monitor.on_change(&r, Utc::now()), AutoJoinAction::Idle);

        r.live.cars[0].used = Some(4);
        assert_eq!(
            monitor.on_change(&r, Utc::now()),
            AutoJoinAction::Join { car: Some("ks_porsche_911_gt3_r".to_string()) }
        );
    }

    #[test]
    fn test_booking_waits_then_disarms_when_car_is_gone() {
        let now = Utc::now();
        let mut monitor = AutoJoinMonitor::arm(false);
        let mut r = record(3, 10);
        r.booking = Some(Booking {
            car_id: "ks_audi_r8_lms".to_string(),
            skin_id: None,
            expires_at: now + chrono::Duration::seconds(60),
        });
        assert_eq!(monitor.on_change(&r, now), AutoJoinAction::Idle);

        r.live.cars.pop();
        assert_eq!(monitor.on_change(&r, now), AutoJoinAction::Disarmed);
        assert!(!monitor.is_active());

        // Never re-arms by itself
        r = record(0, 10);
        assert_eq!(monitor.on_change(&r, now), AutoJoinAction::Idle);
    }

    #[test]
    fn test_booking_joins_when_time_runs_out() {
        let now = Utc::now();
        let mut monitor = AutoJoinMonitor::arm(false);
        let mut r = record(10, 10);
        r.booking = Some(Booking {
            car_id: "ks_audi_r8_lms".to_string(),
            skin_id: None,
            expires_at: now + chrono::Duration::seconds(30),
        });
        assert_eq!(monitor.on_change(&r, now), AutoJoinAction::Idle);
        assert_eq!(
            monitor.on_change(&r, now + chrono::Duration::seconds(31)),
            AutoJoinAction::Join { car: Some("ks_audi_r8_lms".to_string()) }
        );
    }

    #[test]
    fn test_error_after_availability_disarms() {
        let now = Utc::now();
        let mut monitor = AutoJoinMonitor::arm(false);
        let mut r = record(3, 10);
        r.booking = Some(Booking {
            car_id: "ks_audi_r8_lms".to_string(),
            skin_id: None,
            expires_at: now + chrono::Duration::seconds(60),
        });
        assert_eq!(monitor.on_change(&r, now), AutoJoinAction::Idle);
        r.status = Status::Error;
        assert_eq!(monitor.on_change(&r, now), AutoJoinAction::Disarmed);
    }

    #[tokio::test]
    async fn test_session_launches_once() {
        let rig = TestRig::new(vec![test_addr(0)]);
        rig.probe.set_report(test_addr(0), sample_report(8, 8));
        rig.manager.scan().await.unwrap();
        let id = ServerId::from_addr(test_addr(0));
        rig.manager.update(&id, UpdateMode::Normal).await.unwrap();

        rig.manager.arm_autojoin(&id, false, None).await.unwrap();
        assert!(rig.manager.autojoin_armed(&id).await);
        assert!(rig.launcher.started.lock().unwrap().is_empty());

        let mut events = rig.manager.directory().subscribe();
        rig.probe.set_report(test_addr(0), sample_report(7, 8));
        rig.manager.update(&id, UpdateMode::Normal).await.unwrap();
        rig.manager.update(&id, UpdateMode::Normal).await.unwrap();

        // Joined flag goes up and back down once the launcher returns
        loop {
            if let DirectoryEvent::Changed { properties, .. } = events.recv().await.unwrap() {
                let record = rig.manager.directory().get(id.clone()).await.unwrap().unwrap();
                if properties.contains(Property::Joined) && !record.joined {
                    break;
                }
            }
        }
        assert_eq!(rig.launcher.started.lock().unwrap().len(), 1);

        rig.manager.update(&id, UpdateMode::Normal).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(rig.launcher.started.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disarm_cancels_session() {
        let rig = TestRig::new(vec![test_addr(0)]);
        rig.probe.set_report(test_addr(0), sample_report(8, 8));
        rig.manager.scan().await.unwrap();
        let id = ServerId::from_addr(test_addr(0));
        rig.manager.update(&id, UpdateMode::Normal).await.unwrap();

        rig.manager.arm_autojoin(&id, true, None).await.unwrap();
        assert!(rig.manager.disarm_autojoin(&id).await);
        assert!(!rig.manager.disarm_autojoin(&id).await);

        rig.probe.set_report(test_addr(0), sample_report(0, 8));
        rig.manager.update(&id, UpdateMode::Normal).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rig.launcher.started.lock().unwrap().is_empty());
    }
}

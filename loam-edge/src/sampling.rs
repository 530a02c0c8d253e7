use std::time::{Duration, Instant};

use dashmap::DashMap;
use loam_core::{DeviceId, FieldId, Percentage};
use serde::{Deserialize, Serialize};

/// Interval bounds per operating mode, in whole seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub irrigation_interval_sec: u64,
    pub nominal_interval_sec: u64,
    pub dormant_interval_sec: u64,
    /// Power-save interval used when the battery is critical.
    pub emergency_interval_sec: u64,
    /// Battery percentage below which a device enters power-save.
    pub battery_critical_threshold: u8,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            irrigation_interval_sec: 60,
            nominal_interval_sec: 900,
            dormant_interval_sec: 3600,
            emergency_interval_sec: 4 * 3600,
            battery_critical_threshold: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SamplingConfigError {
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("intervals must satisfy irrigation <= nominal <= dormant <= emergency")]
    Unordered,
    #[error("battery threshold {0} is not a percentage")]
    InvalidThreshold(u8),
}

impl SamplingConfig {
    pub fn validate(&self) -> Result<(), SamplingConfigError> {
        let intervals = [
            ("irrigation_interval_sec", self.irrigation_interval_sec),
            ("nominal_interval_sec", self.nominal_interval_sec),
            ("dormant_interval_sec", self.dormant_interval_sec),
            ("emergency_interval_sec", self.emergency_interval_sec),
        ];

        if let Some((name, _)) = intervals.iter().find(|(_, secs)| *secs == 0) {
            return Err(SamplingConfigError::ZeroInterval(*name));
        }
        if !intervals.windows(2).all(|w| w[0].1 <= w[1].1) {
            return Err(SamplingConfigError::Unordered);
        }
        if self.battery_critical_threshold > 100 {
            return Err(SamplingConfigError::InvalidThreshold(
                self.battery_critical_threshold,
            ));
        }

        Ok(())
    }
}

/// Latest irrigation-control signal for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConditions {
    pub irrigation_active: bool,
    pub dormant: bool,
    pub updated_at: jiff::Timestamp,
}

impl FieldConditions {
    pub fn new(irrigation_active: bool, dormant: bool) -> Self {
        Self {
            irrigation_active,
            dormant,
            updated_at: jiff::Timestamp::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleReason {
    LowBattery,
    IrrigationActive,
    Dormant,
    Nominal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleDecision {
    pub interval: Duration,
    pub reason: SampleReason,
    /// Set when the device is in battery power-save.
    pub emergency: bool,
}

/// Decides how often each device reports.
///
/// Pure policy over [`SamplingConfig`]: the controller holds the latest field
/// conditions and battery levels it was told about and performs no I/O.
#[derive(Debug)]
pub struct SamplingController {
    config: SamplingConfig,
    fields: DashMap<FieldId, FieldConditions>,
    batteries: DashMap<DeviceId, Percentage>,
    schedule: DashMap<DeviceId, Instant>,
}

impl SamplingController {
    pub fn new(config: SamplingConfig) -> Result<Self, SamplingConfigError> {
        config.validate()?;

        Ok(Self {
            config,
            fields: DashMap::new(),
            batteries: DashMap::new(),
            schedule: DashMap::new(),
        })
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Replace the conditions of a field. Applying the same update twice is a no-op.
    pub fn update_field_conditions(&self, field_id: FieldId, conditions: FieldConditions) {
        tracing::debug!(
            field_id = field_id.0,
            irrigation_active = conditions.irrigation_active,
            dormant = conditions.dormant,
            "field conditions updated"
        );
        self.fields.insert(field_id, conditions);
    }

    pub fn field_conditions(&self, field_id: FieldId) -> Option<FieldConditions> {
        self.fields.get(&field_id).map(|c| *c)
    }

    pub fn update_battery(&self, device_id: DeviceId, level: Percentage) {
        self.batteries.insert(device_id, level);
    }

    pub fn next_interval(&self, device_id: DeviceId, field_id: FieldId) -> SampleDecision {
        let battery_critical = self
            .batteries
            .get(&device_id)
            .is_some_and(|level| level.0 < self.config.battery_critical_threshold);

        if battery_critical {
            return self.decision(self.config.emergency_interval_sec, SampleReason::LowBattery);
        }

        let conditions = self.field_conditions(field_id);
        match conditions {
            Some(c) if c.irrigation_active => self.decision(
                self.config.irrigation_interval_sec,
                SampleReason::IrrigationActive,
            ),
            Some(c) if c.dormant => {
                self.decision(self.config.dormant_interval_sec, SampleReason::Dormant)
            }
            _ => self.decision(self.config.nominal_interval_sec, SampleReason::Nominal),
        }
    }

    /// Decide the next interval and record when the device should capture again.
    pub fn schedule(&self, device_id: DeviceId, field_id: FieldId, now: Instant) -> SampleDecision {
        let decision = self.next_interval(device_id, field_id);
        self.schedule.insert(device_id, now + decision.interval);
        decision
    }

    pub fn scheduled_at(&self, device_id: DeviceId) -> Option<Instant> {
        self.schedule.get(&device_id).map(|at| *at)
    }

    /// True when the device has never been scheduled or its slot has arrived.
    pub fn due(&self, device_id: DeviceId, now: Instant) -> bool {
        self.scheduled_at(device_id).is_none_or(|at| at <= now)
    }

    pub fn forget(&self, device_id: DeviceId) {
        self.batteries.remove(&device_id);
        self.schedule.remove(&device_id);
    }

    fn decision(&self, secs: u64, reason: SampleReason) -> SampleDecision {
        SampleDecision {
            interval: Duration::from_secs(secs),
            reason,
            emergency: reason == SampleReason::LowBattery,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE: DeviceId = DeviceId(7);
    const FIELD: FieldId = FieldId(3);

    fn controller() -> SamplingController {
        SamplingController::new(SamplingConfig::default()).unwrap()
    }

    #[test]
    fn unknown_device_is_nominal() {
        let decision = controller().next_interval(DEVICE, FIELD);

        assert_eq!(decision.reason, SampleReason::Nominal);
        assert_eq!(decision.interval, Duration::from_secs(900));
        assert!(!decision.emergency);
    }

    #[test]
    fn irrigation_wins_over_dormancy() {
        let controller = controller();
        controller.update_field_conditions(FIELD, FieldConditions::new(true, true));

        let decision = controller.next_interval(DEVICE, FIELD);
        assert_eq!(decision.reason, SampleReason::IrrigationActive);
        assert_eq!(decision.interval, Duration::from_secs(60));
    }

    #[test]
    fn dormant_field_uses_longest_regular_interval() {
        let controller = controller();
        controller.update_field_conditions(FIELD, FieldConditions::new(false, true));

        let decision = controller.next_interval(DEVICE, FIELD);
        assert_eq!(decision.reason, SampleReason::Dormant);
        assert_eq!(decision.interval, Duration::from_secs(3600));
    }

    #[test]
    fn low_battery_overrides_irrigation() {
        let controller = controller();
        controller.update_field_conditions(FIELD, FieldConditions::new(true, false));
        controller.update_battery(DEVICE, Percentage(10));

        let decision = controller.next_interval(DEVICE, FIELD);
        assert_eq!(decision.reason, SampleReason::LowBattery);
        assert!(decision.emergency);
        assert_eq!(decision.interval, Duration::from_secs(4 * 3600));

        // threshold itself is not critical
        controller.update_battery(DEVICE, Percentage(15));
        assert_eq!(
            controller.next_interval(DEVICE, FIELD).reason,
            SampleReason::IrrigationActive
        );
    }

    #[test]
    fn repeated_updates_are_idempotent() {
        let controller = controller();
        let conditions = FieldConditions::new(false, true);

        controller.update_field_conditions(FIELD, conditions);
        let first = controller.next_interval(DEVICE, FIELD);
        controller.update_field_conditions(FIELD, conditions);
        let second = controller.next_interval(DEVICE, FIELD);

        assert_eq!(first, second);
        assert_eq!(controller.field_conditions(FIELD), Some(conditions));
    }

    #[test]
    fn schedule_gates_capture() {
        let controller = controller();
        let now = Instant::now();

        assert!(controller.due(DEVICE, now));
        let decision = controller.schedule(DEVICE, FIELD, now);

        assert_eq!(controller.scheduled_at(DEVICE), Some(now + decision.interval));
        assert!(!controller.due(DEVICE, now + Duration::from_secs(899)));
        assert!(controller.due(DEVICE, now + Duration::from_secs(900)));
    }

    #[test]
    fn config_is_validated() {
        let zero = SamplingConfig {
            irrigation_interval_sec: 0,
            ..Default::default()
        };
        assert_eq!(
            zero.validate(),
            Err(SamplingConfigError::ZeroInterval("irrigation_interval_sec"))
        );

        let unordered = SamplingConfig {
            dormant_interval_sec: 30,
            ..Default::default()
        };
        assert_eq!(unordered.validate(), Err(SamplingConfigError::Unordered));

        let threshold = SamplingConfig {
            battery_critical_threshold: 101,
            ..Default::default()
        };
        assert!(SamplingController::new(threshold).is_err());
    }
}

pub mod codec;
pub mod fec;
mod wire;

pub use wire::*;

use ordered_float::NotNan;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

// We use `Box<str>` and `Box<[T]>` for structures that don't need to be
// dynamically sized. This helps us keep allocations compact and avoid
// accidental cloning of large values.
type BoxStr = Box<str>;
type BoxList<T> = Box<[T]>;

/// Upper bound on channels carried by a single reading.
pub const MAX_CHANNELS: usize = 32;

/// Stable identifier for a field device, as assigned at provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

/// Identifier of an agricultural field (irrigation block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldId(pub u32);

/// Identifier of a processing node (primary, mirror or cold spare).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u16);

/// Identifier of a backhaul endpoint in the gateway's connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub u16);

/// Unique identifier for a message handed to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Ulid);

impl MessageId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier for an alert raised to the alerting collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertId(pub Ulid);

/// Identifier of the gateway that owns a backhaul session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatewayId(pub Ulid);

/// Tenant owning a field, carried through to storage rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub BoxStr);

/// Percentage value in the range 0–100 (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Percentage(pub u8);

/// Monotonic device clock, milliseconds since the device booted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceTimestamp(pub u64);

impl DeviceTimestamp {
    pub fn from_secs(secs: u64) -> Self {
        Self(secs * 1000)
    }
}

/// Measured quantity carried by a reading channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelKind {
    Moisture = 0x01,
    Temperature = 0x02,
    Conductivity = 0x03,
    Ph = 0x04,
    Battery = 0x05,
    Rainfall = 0x06,
}

impl ChannelKind {
    /// Measurement type name used in storage rows.
    pub fn measurement(&self) -> &'static str {
        match self {
            ChannelKind::Moisture => "soil_moisture",
            ChannelKind::Temperature => "soil_temperature",
            ChannelKind::Conductivity => "electrical_conductivity",
            ChannelKind::Ph => "soil_ph",
            ChannelKind::Battery => "battery_voltage",
            ChannelKind::Rainfall => "rainfall",
        }
    }

    pub fn unit(&self) -> MetricUnit {
        match self {
            ChannelKind::Moisture => MetricUnit::Percent,
            ChannelKind::Temperature => MetricUnit::Celsius,
            ChannelKind::Conductivity => MetricUnit::MilliSiemensPerCm,
            ChannelKind::Ph => MetricUnit::Ph,
            ChannelKind::Battery => MetricUnit::Volt,
            ChannelKind::Rainfall => MetricUnit::Mm,
        }
    }
}

impl TryFrom<u8> for ChannelKind {
    type Error = codec::CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ChannelKind::Moisture),
            0x02 => Ok(ChannelKind::Temperature),
            0x03 => Ok(ChannelKind::Conductivity),
            0x04 => Ok(ChannelKind::Ph),
            0x05 => Ok(ChannelKind::Battery),
            0x06 => Ok(ChannelKind::Rainfall),
            _ => Err(codec::CodecError::InvalidChannelKind(value)),
        }
    }
}

/// Units used by channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricUnit {
    /// Percent (%) values.
    Percent,
    /// Degrees Celsius (°C).
    Celsius,
    /// Millisiemens per centimetre.
    MilliSiemensPerCm,
    /// Dimensionless pH.
    Ph,
    /// Volts.
    Volt,
    /// Millimeters (mm).
    Mm,
}

impl MetricUnit {
    pub fn symbol(&self) -> &'static str {
        match self {
            MetricUnit::Percent => "%",
            MetricUnit::Celsius => "°C",
            MetricUnit::MilliSiemensPerCm => "mS/cm",
            MetricUnit::Ph => "pH",
            MetricUnit::Volt => "V",
            MetricUnit::Mm => "mm",
        }
    }
}

/// One named value within a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelValue {
    pub kind: ChannelKind,
    pub value: NotNan<f64>,
}

impl ChannelValue {
    pub fn new(kind: ChannelKind, value: f64) -> Result<Self, ReadingError> {
        if value.is_infinite() {
            return Err(ReadingError::NotFinite(kind));
        }
        let value = NotNan::new(value).map_err(|_| ReadingError::NotANumber(kind))?;
        Ok(Self { kind, value })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadingError {
    #[error("reading has no channels")]
    NoChannels,
    #[error("reading has {0} channels, at most {MAX_CHANNELS} are allowed")]
    TooManyChannels(usize),
    #[error("channel {0:?} appears more than once")]
    DuplicateChannel(ChannelKind),
    #[error("channel {0:?} is NaN")]
    NotANumber(ChannelKind),
    #[error("channel {0:?} is not finite")]
    NotFinite(ChannelKind),
}

/// One measurement sample emitted by a field device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reading {
    /// Source device.
    pub device_id: DeviceId,
    /// Field the device is planted in.
    pub field_id: FieldId,
    /// Device clock at capture time.
    pub timestamp: DeviceTimestamp,
    /// Channel values, in the order the device reports them.
    pub channels: BoxList<ChannelValue>,
    /// Depth slot for multi-depth probes.
    pub depth_index: Option<u8>,
}

impl Reading {
    pub fn new(
        device_id: DeviceId,
        field_id: FieldId,
        timestamp: DeviceTimestamp,
        channels: Vec<ChannelValue>,
        depth_index: Option<u8>,
    ) -> Result<Self, ReadingError> {
        if channels.is_empty() {
            return Err(ReadingError::NoChannels);
        }
        if channels.len() > MAX_CHANNELS {
            return Err(ReadingError::TooManyChannels(channels.len()));
        }
        for (i, channel) in channels.iter().enumerate() {
            if channels[..i].iter().any(|c| c.kind == channel.kind) {
                return Err(ReadingError::DuplicateChannel(channel.kind));
            }
        }

        Ok(Self {
            device_id,
            field_id,
            timestamp,
            channels: channels.into_boxed_slice(),
            depth_index,
        })
    }

    pub fn value(&self, kind: ChannelKind) -> Option<f64> {
        self.channels
            .iter()
            .find(|c| c.kind == kind)
            .map(|c| c.value.into_inner())
    }

    /// True when both readings carry the same channels in the same order.
    pub fn same_layout(&self, other: &Reading) -> bool {
        self.channels.len() == other.channels.len()
            && self
                .channels
                .iter()
                .zip(other.channels.iter())
                .all(|(a, b)| a.kind == b.kind)
    }
}

/// Transport priority class. Lower numeric value means higher priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Emergency = 0,
    Control = 1,
    Telemetry = 2,
    Bulk = 3,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Emergency,
        Priority::Control,
        Priority::Telemetry,
        Priority::Bulk,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// The next higher class, saturating at `Emergency`.
    pub fn promoted(self) -> Priority {
        match self {
            Priority::Emergency | Priority::Control => Priority::Emergency,
            Priority::Telemetry => Priority::Control,
            Priority::Bulk => Priority::Telemetry,
        }
    }
}

/// Role of a processing node in the redundancy hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Primary,
    Mirror,
    ColdSpare,
    /// Former primary demoted by a failover; awaits an explicit recovery signal.
    Degraded,
}

/// Identifies the sensor a row came from: one channel of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorId {
    pub device_id: DeviceId,
    pub channel: ChannelKind,
}

/// Row handed to the downstream time-series store, one per channel value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRow {
    pub timestamp: DeviceTimestamp,
    pub sensor_id: SensorId,
    pub field_id: FieldId,
    pub tenant_id: TenantId,
    pub measurement: BoxStr,
    pub value: f64,
    pub unit: MetricUnit,
    pub depth_index: Option<u8>,
    /// Computed by sensor-side signing; carried through untouched.
    pub content_hash: Option<BoxStr>,
    /// Computed by sensor-side signing; carried through untouched.
    pub signature: Option<BoxStr>,
    pub ingested_at: jiff::Timestamp,
}

impl StorageRow {
    /// Expand a decoded reading into one row per channel.
    pub fn from_reading(
        reading: &Reading,
        tenant_id: &TenantId,
        attestation: Option<&Attestation>,
        ingested_at: jiff::Timestamp,
    ) -> Vec<StorageRow> {
        reading
            .channels
            .iter()
            .map(|channel| StorageRow {
                timestamp: reading.timestamp,
                sensor_id: SensorId {
                    device_id: reading.device_id,
                    channel: channel.kind,
                },
                field_id: reading.field_id,
                tenant_id: tenant_id.clone(),
                measurement: channel.kind.measurement().into(),
                value: channel.value.into_inner(),
                unit: channel.kind.unit(),
                depth_index: reading.depth_index,
                content_hash: attestation.map(|a| a.content_hash.clone()),
                signature: attestation.map(|a| a.signature.clone()),
                ingested_at,
            })
            .collect()
    }
}

/// Identity of a stored row. Storing a row under an existing key replaces it.
///
/// Keys order by device, channel, timestamp and depth; mirrors page through a
/// primary's rows in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    pub device_id: DeviceId,
    pub channel: ChannelKind,
    pub timestamp: DeviceTimestamp,
    pub depth_index: Option<u8>,
}

impl RowKey {
    pub fn of(row: &StorageRow) -> Self {
        Self {
            device_id: row.sensor_id.device_id,
            channel: row.sensor_id.channel,
            timestamp: row.timestamp,
            depth_index: row.depth_index,
        }
    }
}

/// Sensor-side signature material for one reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub device_id: DeviceId,
    pub timestamp: DeviceTimestamp,
    pub content_hash: BoxStr,
    pub signature: BoxStr,
}

/// Severity of an operational alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
    /// Requires human intervention.
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    HeartbeatMissed,
    HeartbeatRestored,
    FailoverTriggered,
    PromotionCompleted,
    PromotionTimeout,
    RecoveryStarted,
    RecoveryCompleted,
    ColdSpareRequested,
    ColdSpareTimeout,
    UnexpectedHeartbeat,
    DeliveryFailed,
}

/// Alert delivered to the external alerting collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub severity: AlertSeverity,
    pub kind: AlertKind,
    /// Node the alert concerns, if any.
    pub node_id: Option<NodeId>,
    pub message: BoxStr,
    pub timestamp: jiff::Timestamp,
}

impl Alert {
    pub fn new(
        severity: AlertSeverity,
        kind: AlertKind,
        node_id: Option<NodeId>,
        message: impl Into<BoxStr>,
    ) -> Self {
        Self {
            id: AlertId(Ulid::new()),
            severity,
            kind,
            node_id,
            message: message.into(),
            timestamp: jiff::Timestamp::now(),
        }
    }
}

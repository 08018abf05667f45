use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only timestamp type.
pub type Ms = i64;

/// Store key of the zone-occupancy singleton.
pub const ZONE_STATS_KEY: &str = "live";

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriorityType {
    Normal,
    Elderly,
    Disabled,
    WomenWithChildren,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Gate {
    #[serde(rename = "Gate A")]
    A,
    #[serde(rename = "Gate B")]
    B,
    #[serde(rename = "Gate C")]
    C,
}

impl Gate {
    pub const ALL: [Gate; 3] = [Gate::A, Gate::B, Gate::C];

    pub fn as_str(self) -> &'static str {
        match self {
            Gate::A => "Gate A",
            Gate::B => "Gate B",
            Gate::C => "Gate C",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Booked,
    #[serde(rename = "Checked-In")]
    CheckedIn,
    Cancelled,
    Expired,
}

impl BookingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Booked => "Booked",
            BookingStatus::CheckedIn => "Checked-In",
            BookingStatus::Cancelled => "Cancelled",
            BookingStatus::Expired => "Expired",
        }
    }

    /// Only `Booked` moves, and only once.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Booked, CheckedIn) | (Booked, Cancelled) | (Booked, Expired)
        )
    }
}

/// A bookable darshan window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub max_capacity: u32,
    pub booked_count: u32,
    pub locked: bool,
}

impl Slot {
    pub fn remaining(&self) -> u32 {
        self.max_capacity.saturating_sub(self.booked_count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    /// External-facing code handed to the pilgrim; also the store key.
    pub booking_id: String,
    pub user_id: String,
    pub name: String,
    pub phone: Option<String>,
    pub date: NaiveDate,
    pub slot_id: Ulid,
    pub members_count: u32,
    pub priority_type: PriorityType,
    pub gate: Gate,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub checked_in_at: Option<Ms>,
    /// Set when the booking is cancelled and cleared once its seats are back
    /// in the slot.
    pub release_pending: bool,
}

// ── Zones ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    Gate,
    Queue,
    Inner,
    Exit,
}

const ZONE_KEYS: [(Zone, &str); 4] = [
    (Zone::Gate, "zone-gate"),
    (Zone::Queue, "zone-queue"),
    (Zone::Inner, "zone-inner"),
    (Zone::Exit, "zone-exit"),
];

impl Zone {
    pub const ALL: [Zone; 4] = [Zone::Gate, Zone::Queue, Zone::Inner, Zone::Exit];

    pub fn index(self) -> usize {
        match self {
            Zone::Gate => 0,
            Zone::Queue => 1,
            Zone::Inner => 2,
            Zone::Exit => 3,
        }
    }

    /// External identifier used by sensors and dashboards.
    pub fn key(self) -> &'static str {
        ZONE_KEYS[self.index()].1
    }

    pub fn from_key(key: &str) -> Option<Zone> {
        ZONE_KEYS.iter().find(|(_, k)| *k == key).map(|(z, _)| *z)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ZoneStats {
    pub gate: u32,
    pub queue: u32,
    pub inner: u32,
    pub exit: u32,
    pub updated_at: Ms,
}

impl ZoneStats {
    pub fn get(&self, zone: Zone) -> u32 {
        match zone {
            Zone::Gate => self.gate,
            Zone::Queue => self.queue,
            Zone::Inner => self.inner,
            Zone::Exit => self.exit,
        }
    }

    pub fn set(&mut self, zone: Zone, value: u32) {
        match zone {
            Zone::Gate => self.gate = value,
            Zone::Queue => self.queue = value,
            Zone::Inner => self.inner = value,
            Zone::Exit => self.exit = value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CrowdLevel {
    Low,
    Moderate,
    High,
    Critical,
}

// ── Emergencies ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SosType {
    Medical,
    Security,
    LostChild,
    CrowdRisk,
}

impl SosType {
    pub const ALL: [SosType; 4] = [
        SosType::Medical,
        SosType::Security,
        SosType::LostChild,
        SosType::CrowdRisk,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SosType::Medical => "medical",
            SosType::Security => "security",
            SosType::LostChild => "lost-child",
            SosType::CrowdRisk => "crowd-risk",
        }
    }

    /// Which pool answers this kind of case.
    pub fn responder(self) -> ResponderKind {
        match self {
            SosType::Medical => ResponderKind::Ambulance,
            SosType::Security | SosType::LostChild | SosType::CrowdRisk => ResponderKind::Security,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// One level up, saturating at `Critical`.
    pub fn escalated(self) -> Severity {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SosStatus {
    Pending,
    Assigned,
    Enroute,
    Resolved,
}

impl SosStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SosStatus::Pending => "Pending",
            SosStatus::Assigned => "Assigned",
            SosStatus::Enroute => "Enroute",
            SosStatus::Resolved => "Resolved",
        }
    }

    pub fn can_transition_to(self, next: SosStatus) -> bool {
        use SosStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned) | (Assigned, Enroute) | (Assigned, Resolved) | (Enroute, Resolved)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub const ORIGIN: GeoPoint = GeoPoint { lat: 0.0, lng: 0.0 };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SosRequest {
    pub id: Ulid,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: SosType,
    pub severity: Severity,
    pub location: GeoPoint,
    pub note: Option<String>,
    pub status: SosStatus,
    /// Set iff status is `Assigned` or `Enroute`.
    pub assigned_to: Option<String>,
    pub responder: Option<ResponderKind>,
    /// Minutes.
    pub eta: Option<u32>,
    pub created_at: Ms,
    /// Set iff status is `Resolved`.
    pub resolved_at: Option<Ms>,
    pub resolved_by: Option<String>,
    pub escalations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Active,
    Responded,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentStatus::Active => "active",
            IncidentStatus::Responded => "responded",
            IncidentStatus::Resolved => "resolved",
        }
    }

    pub fn can_transition_to(self, next: IncidentStatus) -> bool {
        use IncidentStatus::*;
        matches!(
            (self, next),
            (Active, Responded) | (Active, Resolved) | (Responded, Resolved)
        )
    }
}

/// A security/police report. Units are picked by location, not from the live pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Ulid,
    #[serde(rename = "type")]
    pub kind: String,
    pub location: String,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub assigned_unit: String,
    pub escalated_to: Option<String>,
    pub timestamp: Ms,
    pub resolved_at: Option<Ms>,
}

// ── Responders ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponderKind {
    Security,
    Ambulance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Available,
    Busy,
}

impl UnitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Available => "available",
            UnitStatus::Busy => "busy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityUnit {
    pub id: String,
    pub name: String,
    pub status: UnitStatus,
    pub zone: String,
    pub personnel: u32,
    pub assigned_case: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambulance {
    pub id: String,
    pub status: UnitStatus,
    pub location: String,
    pub crew: u32,
    pub assigned_case: Option<Ulid>,
}

// ── Store records ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    Slot,
    Booking,
    ZoneStats,
    Sos,
    Incident,
    SecurityUnit,
    Ambulance,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Slot => "slot",
            Kind::Booking => "booking",
            Kind::ZoneStats => "zone_stats",
            Kind::Sos => "sos",
            Kind::Incident => "incident",
            Kind::SecurityUnit => "security_unit",
            Kind::Ambulance => "ambulance",
        }
    }
}

/// Everything the store holds. This is also the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    Slot(Slot),
    Booking(Booking),
    ZoneStats(ZoneStats),
    Sos(SosRequest),
    Incident(Incident),
    SecurityUnit(SecurityUnit),
    Ambulance(Ambulance),
}

impl Record {
    pub fn kind(&self) -> Kind {
        match self {
            Record::Slot(_) => Kind::Slot,
            Record::Booking(_) => Kind::Booking,
            Record::ZoneStats(_) => Kind::ZoneStats,
            Record::Sos(_) => Kind::Sos,
            Record::Incident(_) => Kind::Incident,
            Record::SecurityUnit(_) => Kind::SecurityUnit,
            Record::Ambulance(_) => Kind::Ambulance,
        }
    }

    pub fn key(&self) -> String {
        match self {
            Record::Slot(r) => r.key(),
            Record::Booking(r) => r.key(),
            Record::ZoneStats(r) => r.key(),
            Record::Sos(r) => r.key(),
            Record::Incident(r) => r.key(),
            Record::SecurityUnit(r) => r.key(),
            Record::Ambulance(r) => r.key(),
        }
    }
}

/// Typed view over one `Record` variant.
pub trait Entity: Clone + Send + Sync + Sized + 'static {
    const KIND: Kind;
    fn key(&self) -> String;
    fn into_record(self) -> Record;
    fn from_record(record: Record) -> Option<Self>;
}

macro_rules! entity {
    ($ty:ty, $variant:ident, |$this:ident| $key:expr) => {
        impl Entity for $ty {
            const KIND: Kind = Kind::$variant;

            fn key(&self) -> String {
                let $this = self;
                $key
            }

            fn into_record(self) -> Record {
                Record::$variant(self)
            }

            fn from_record(record: Record) -> Option<Self> {
                match record {
                    Record::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

entity!(Slot, Slot, |s| s.id.to_string());
entity!(Booking, Booking, |b| b.booking_id.clone());
entity!(ZoneStats, ZoneStats, |_z| ZONE_STATS_KEY.to_string());
entity!(SosRequest, Sos, |s| s.id.to_string());
entity!(Incident, Incident, |i| i.id.to_string());
entity!(SecurityUnit, SecurityUnit, |u| u.id.clone());
entity!(Ambulance, Ambulance, |a| a.id.clone());

/// Store-side selection. A filter that doesn't apply to a record's kind never matches it.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Date(NaiveDate),
    User(String),
    Slot(Ulid),
    BookingStatus(BookingStatus),
    SosStatus(SosStatus),
    SosType(SosType),
    IncidentStatus(IncidentStatus),
    UnitStatus(UnitStatus),
}

impl Filter {
    pub fn matches(&self, record: &Record) -> bool {
        match (self, record) {
            (Filter::All, _) => true,
            (Filter::Date(d), Record::Slot(s)) => s.date == *d,
            (Filter::Date(d), Record::Booking(b)) => b.date == *d,
            (Filter::User(u), Record::Booking(b)) => b.user_id == *u,
            (Filter::User(u), Record::Sos(s)) => s.user_id == *u,
            (Filter::Slot(id), Record::Booking(b)) => b.slot_id == *id,
            (Filter::BookingStatus(st), Record::Booking(b)) => b.status == *st,
            (Filter::SosStatus(st), Record::Sos(s)) => s.status == *st,
            (Filter::SosType(t), Record::Sos(s)) => s.kind == *t,
            (Filter::IncidentStatus(st), Record::Incident(i)) => i.status == *st,
            (Filter::UnitStatus(st), Record::SecurityUnit(u)) => u.status == *st,
            (Filter::UnitStatus(st), Record::Ambulance(a)) => a.status == *st,
            _ => false,
        }
    }
}

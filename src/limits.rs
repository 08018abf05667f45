pub const MAX_NAME_LEN: usize = 120;
pub const MAX_NOTE_LEN: usize = 1_000;
pub const MAX_LOCATION_LEN: usize = 200;
pub const MAX_MEMBERS_PER_BOOKING: u32 = 10;
pub const MAX_SLOT_CAPACITY: u32 = 100_000;
/// Fresh booking codes drawn before a create gives up on finding a free one.
pub const MAX_CODE_ATTEMPTS: usize = 8;
pub const MAX_ETA_MINUTES: u32 = 24 * 60;
/// Upper bound on the stale-SOS escalation window: one week.
pub const MAX_ESCALATE_AFTER_SECS: u64 = 7 * 24 * 60 * 60;

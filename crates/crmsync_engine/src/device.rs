//! Device bridge contract.
//!
//! The engine reads the device call log and address book and mirrors
//! server contacts back into the address book through [`DeviceBridge`].
//! Failures are reported as [`SyncError::Device`] and never abort a run.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, TimeZone, Utc};
use crmsync_protocol::{normalize_phone, temp_call_id, CallDirection, CallLog, Contact};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Opaque handle of an address-book entry.
pub type DeviceRef = String;

/// Call type as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawCallKind {
    /// Answered incoming call.
    Incoming,
    /// Outgoing call.
    Outgoing,
    /// Unanswered incoming call.
    Missed,
    /// Declined incoming call.
    Rejected,
    /// Voicemail, blocked, or an unknown platform code.
    Other(i32),
}

/// A call-log row as read off the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCallRecord {
    /// Number as stored by the dialer.
    pub number: String,
    /// Call start in epoch milliseconds.
    pub timestamp_millis: i64,
    /// Duration in seconds.
    pub duration_seconds: i64,
    /// Call type.
    pub kind: RawCallKind,
}

impl RawCallRecord {
    /// Converts the row into a temp-id call log.
    ///
    /// Fails for rows that cannot be represented: unknown kinds, unparsable
    /// numbers, or out-of-range timestamps.
    pub fn to_call_log(&self, owner_id: &str) -> SyncResult<CallLog> {
        let direction = match self.kind {
            RawCallKind::Incoming => CallDirection::Incoming,
            RawCallKind::Outgoing => CallDirection::Outgoing,
            RawCallKind::Missed | RawCallKind::Rejected => CallDirection::Missed,
            RawCallKind::Other(code) => {
                return Err(SyncError::Validation(format!("unsupported call type {code}")))
            }
        };
        let phone_number = normalize_phone(&self.number)?;
        let timestamp = millis_to_utc(self.timestamp_millis)?;

        Ok(CallLog {
            id: temp_call_id(&timestamp, &phone_number),
            owner_id: owner_id.to_string(),
            contact_id: None,
            direction,
            duration_seconds: u32::try_from(self.duration_seconds.max(0)).unwrap_or(u32::MAX),
            timestamp,
            phone_number,
            created_at: timestamp,
        })
    }
}

/// An address-book entry as read off the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawContact {
    /// Display name.
    pub display_name: String,
    /// First phone number of the entry.
    pub phone: String,
}

/// Access to the device call log and address book.
pub trait DeviceBridge: Send + Sync {
    /// Call-log rows at or after `since_epoch_millis`.
    fn read_device_call_logs(&self, since_epoch_millis: i64) -> SyncResult<Vec<RawCallRecord>>;

    /// All address-book entries.
    fn read_device_contacts(&self) -> SyncResult<Vec<RawContact>>;

    /// Creates an address-book entry and returns its handle.
    fn write_contact(&self, contact: &Contact) -> SyncResult<DeviceRef>;

    /// Overwrites an entry this app created.
    fn update_contact(&self, device_ref: &str, contact: &Contact) -> SyncResult<()>;

    /// Removes an entry this app created.
    fn delete_contact(&self, device_ref: &str) -> SyncResult<()>;

    /// Handles of every entry this app created.
    fn list_owned_device_refs(&self) -> SyncResult<Vec<DeviceRef>>;

    /// Returns false when there is no device to mirror to.
    fn is_available(&self) -> bool {
        true
    }
}

/// Bridge for hosts without a device (servers, CLIs).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDevice;

impl DeviceBridge for NoDevice {
    fn read_device_call_logs(&self, _since_epoch_millis: i64) -> SyncResult<Vec<RawCallRecord>> {
        Ok(Vec::new())
    }

    fn read_device_contacts(&self) -> SyncResult<Vec<RawContact>> {
        Ok(Vec::new())
    }

    fn write_contact(&self, _contact: &Contact) -> SyncResult<DeviceRef> {
        Err(SyncError::Device("no device attached".into()))
    }

    fn update_contact(&self, _device_ref: &str, _contact: &Contact) -> SyncResult<()> {
        Err(SyncError::Device("no device attached".into()))
    }

    fn delete_contact(&self, _device_ref: &str) -> SyncResult<()> {
        Ok(())
    }

    fn list_owned_device_refs(&self) -> SyncResult<Vec<DeviceRef>> {
        Ok(Vec::new())
    }

    fn is_available(&self) -> bool {
        false
    }
}

/// In-memory device, for tests and simulators.
#[derive(Debug, Default)]
pub struct MemoryDeviceBridge {
    owned: RwLock<BTreeMap<DeviceRef, Contact>>,
    foreign: RwLock<Vec<RawContact>>,
    call_log: RwLock<Vec<RawCallRecord>>,
    next_ref: AtomicU64,
    failing: AtomicBool,
}

impl MemoryDeviceBridge {
    /// Creates an empty device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a row to the call log.
    pub fn push_call(&self, record: RawCallRecord) {
        self.call_log.write().push(record);
    }

    /// Adds an address-book entry this app did not create.
    pub fn push_contact(&self, contact: RawContact) {
        self.foreign.write().push(contact);
    }

    /// Entries this app created, by handle.
    pub fn owned_contacts(&self) -> BTreeMap<DeviceRef, Contact> {
        self.owned.read().clone()
    }

    /// Makes every call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn guard(&self) -> SyncResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(SyncError::Device("permission denied".into()))
        } else {
            Ok(())
        }
    }
}

impl DeviceBridge for MemoryDeviceBridge {
    fn read_device_call_logs(&self, since_epoch_millis: i64) -> SyncResult<Vec<RawCallRecord>> {
        self.guard()?;
        Ok(self
            .call_log
            .read()
            .iter()
            .filter(|r| r.timestamp_millis >= since_epoch_millis)
            .cloned()
            .collect())
    }

    fn read_device_contacts(&self) -> SyncResult<Vec<RawContact>> {
        self.guard()?;
        let mut contacts = self.foreign.read().clone();
        contacts.extend(self.owned.read().values().map(|c| RawContact {
            display_name: c.name.clone(),
            phone: c.phone_raw.clone(),
        }));
        Ok(contacts)
    }

    fn write_contact(&self, contact: &Contact) -> SyncResult<DeviceRef> {
        self.guard()?;
        let device_ref = format!("dev-{}", self.next_ref.fetch_add(1, Ordering::SeqCst) + 1);
        self.owned.write().insert(device_ref.clone(), contact.clone());
        Ok(device_ref)
    }

    fn update_contact(&self, device_ref: &str, contact: &Contact) -> SyncResult<()> {
        self.guard()?;
        match self.owned.write().get_mut(device_ref) {
            Some(entry) => {
                *entry = contact.clone();
                Ok(())
            }
            None => Err(SyncError::Device(format!("no entry {device_ref}"))),
        }
    }

    fn delete_contact(&self, device_ref: &str) -> SyncResult<()> {
        self.guard()?;
        self.owned.write().remove(device_ref);
        Ok(())
    }

    fn list_owned_device_refs(&self) -> SyncResult<Vec<DeviceRef>> {
        self.guard()?;
        Ok(self.owned.read().keys().cloned().collect())
    }
}

/// Converts epoch milliseconds to a UTC timestamp.
pub(crate) fn millis_to_utc(millis: i64) -> SyncResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| SyncError::Validation(format!("timestamp out of range: {millis}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(number: &str, millis: i64, kind: RawCallKind) -> RawCallRecord {
        RawCallRecord {
            number: number.into(),
            timestamp_millis: millis,
            duration_seconds: 42,
            kind,
        }
    }

    #[test]
    fn raw_call_conversion() {
        let call = raw("+1 (555) 010-0100", 1_700_000_000_000, RawCallKind::Outgoing)
            .to_call_log("u1")
            .unwrap();
        assert!(call.is_temporary());
        assert_eq!(call.phone_number, "+15550100100");
        assert_eq!(call.direction, CallDirection::Outgoing);
        assert_eq!(call.timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(call.duration_seconds, 42);
    }

    #[test]
    fn conversion_is_deterministic() {
        let record = raw("5550100", 1_700_000_000_000, RawCallKind::Incoming);
        assert_eq!(
            record.to_call_log("u1").unwrap().id,
            record.to_call_log("u1").unwrap().id
        );
    }

    #[test]
    fn rejected_maps_to_missed() {
        let call = raw("5550100", 1, RawCallKind::Rejected).to_call_log("u1").unwrap();
        assert_eq!(call.direction, CallDirection::Missed);
    }

    #[test]
    fn unrepresentable_rows_fail() {
        assert!(raw("5550100", 1, RawCallKind::Other(4)).to_call_log("u1").is_err());
        assert!(raw("private", 1, RawCallKind::Incoming).to_call_log("u1").is_err());
        assert!(raw("5550100", i64::MAX, RawCallKind::Incoming).to_call_log("u1").is_err());
    }

    #[test]
    fn memory_device_round_trip() {
        let device = MemoryDeviceBridge::new();
        device.push_call(raw("5550100", 1_000, RawCallKind::Incoming));
        device.push_call(raw("5550200", 5_000, RawCallKind::Incoming));
        assert_eq!(device.read_device_call_logs(2_000).unwrap().len(), 1);

        let contact = crate::store::LocalContact::new_local("u1", "Ada", "5550100")
            .unwrap()
            .contact;
        let handle = device.write_contact(&contact).unwrap();
        assert_eq!(device.list_owned_device_refs().unwrap(), vec![handle.clone()]);

        device.delete_contact(&handle).unwrap();
        assert!(device.list_owned_device_refs().unwrap().is_empty());
    }

    #[test]
    fn failing_device() {
        let device = MemoryDeviceBridge::new();
        device.set_failing(true);
        assert!(matches!(
            device.read_device_contacts(),
            Err(SyncError::Device(_))
        ));
    }
}

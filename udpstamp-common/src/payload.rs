/// Size of the timing payload carried right after the UDP header.
pub const PAYLOAD_LEN: usize = 24;

const FIELD_LEN: usize = 8;
const PACKET_ID_AT: usize = 0;
const INGRESS_TS_AT: usize = 8;
const EGRESS_TS_AT: usize = 16;

// Wire layout of the payload:
//
//   offset 0:  packet_id   u64, big-endian (assigned by the packet generator)
//   offset 8:  ingress_ts  u64, little-endian
//   offset 16: egress_ts   u64, little-endian

/// Mutable view over the 24 payload bytes of a validated frame.
///
/// Only obtainable through [`crate::payload_mut`], i.e. after the frame has
/// passed the full length and header check.
pub struct TimingPayloadMut<'a> {
    bytes: &'a mut [u8; PAYLOAD_LEN],
}

impl<'a> TimingPayloadMut<'a> {
    #[inline(always)]
    pub(crate) fn new(bytes: &'a mut [u8; PAYLOAD_LEN]) -> Self {
        Self { bytes }
    }

    #[inline(always)]
    pub fn packet_id(&self) -> u64 {
        u64::from_be_bytes(read_field::<PACKET_ID_AT>(self.bytes))
    }

    #[inline(always)]
    pub fn ingress_ts(&self) -> u64 {
        u64::from_le_bytes(read_field::<INGRESS_TS_AT>(self.bytes))
    }

    #[inline(always)]
    pub fn egress_ts(&self) -> u64 {
        u64::from_le_bytes(read_field::<EGRESS_TS_AT>(self.bytes))
    }

    #[inline(always)]
    pub fn set_ingress_ts(&mut self, ns: u64) {
        write_field::<INGRESS_TS_AT>(self.bytes, ns.to_le_bytes());
    }

    #[inline(always)]
    pub fn set_egress_ts(&mut self, ns: u64) {
        write_field::<EGRESS_TS_AT>(self.bytes, ns.to_le_bytes());
    }

    /// Owned copy of the three fields.
    #[inline(always)]
    pub fn record(&self) -> TimingRecord {
        TimingRecord {
            packet_id: self.packet_id(),
            ingress_ts: self.ingress_ts(),
            egress_ts: self.egress_ts(),
        }
    }
}

#[inline(always)]
fn read_field<const AT: usize>(bytes: &[u8; PAYLOAD_LEN]) -> [u8; FIELD_LEN] {
    let mut field = [0u8; FIELD_LEN];
    field.copy_from_slice(&bytes[AT..AT + FIELD_LEN]);
    field
}

#[inline(always)]
fn write_field<const AT: usize>(bytes: &mut [u8; PAYLOAD_LEN], field: [u8; FIELD_LEN]) {
    bytes[AT..AT + FIELD_LEN].copy_from_slice(&field);
}

/// Decoded timing payload, as observed by a collector after both stamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct TimingRecord {
    pub packet_id: u64,
    pub ingress_ts: u64,
    pub egress_ts: u64,
}

impl TimingRecord {
    /// Decode the first [`PAYLOAD_LEN`] bytes of a UDP payload.
    ///
    /// Trailing bytes are ignored; anything shorter is not a timing payload.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        let bytes: &[u8; PAYLOAD_LEN] = payload.get(..PAYLOAD_LEN)?.try_into().ok()?;
        Some(Self {
            packet_id: u64::from_be_bytes(read_field::<PACKET_ID_AT>(bytes)),
            ingress_ts: u64::from_le_bytes(read_field::<INGRESS_TS_AT>(bytes)),
            egress_ts: u64::from_le_bytes(read_field::<EGRESS_TS_AT>(bytes)),
        })
    }

    pub fn encode(&self) -> [u8; PAYLOAD_LEN] {
        let mut bytes = [0u8; PAYLOAD_LEN];
        write_field::<PACKET_ID_AT>(&mut bytes, self.packet_id.to_be_bytes());
        write_field::<INGRESS_TS_AT>(&mut bytes, self.ingress_ts.to_le_bytes());
        write_field::<EGRESS_TS_AT>(&mut bytes, self.egress_ts.to_le_bytes());
        bytes
    }

    /// One-way latency across the measured path.
    ///
    /// `None` for pairs that cannot be trusted: either stamp missing, or the
    /// egress stamp preceding the ingress stamp.
    pub fn latency_ns(&self) -> Option<u64> {
        if self.ingress_ts == 0 || self.egress_ts == 0 {
            return None;
        }
        self.egress_ts.checked_sub(self.ingress_ts)
    }

    /// Raw `egress_ts - ingress_ts`, without any validity filtering.
    pub fn delta_ns(&self) -> i64 {
        self.egress_ts.wrapping_sub(self.ingress_ts) as i64
    }

    /// Egress stamped while the ingress stamp is missing.
    pub fn skipped_ingress(&self) -> bool {
        self.egress_ts != 0 && self.ingress_ts == 0
    }
}

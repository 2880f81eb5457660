//! Parcel marshalling.
//!
//! Everything is little-endian and 4-byte aligned. Strings travel as UTF-16
//! with a length prefix in code units and a NUL terminator; nullable
//! parcelables carry a presence word; binder objects are written inline as
//! `flat_binder_object` records with their offsets collected in a side
//! table for the kernel.

use crate::protocol::BinderProtocol;

/// `B_PACK_CHARS('s','b','*',0x85)` and friends from the kernel uapi.
pub const BINDER_TYPE_BINDER: u32 = 0x7362_2a85;
pub const BINDER_TYPE_HANDLE: u32 = 0x7368_2a85;
pub const BINDER_TYPE_FD: u32 = 0x6664_2a85;

const FLAT_BINDER_FLAG_ACCEPTS_FDS: u32 = 0x100;
/// Scheduler priority mask passed through for local objects.
const FLAT_BINDER_PRIORITY_MASK: u32 = 0x7f;

/// `StrictMode.PENALTY_GATHER`, always set on outgoing calls.
const STRICT_MODE_PENALTY_GATHER: i32 = 0x40 << 16;
/// Work source attribution is left unset.
const UNSET_WORK_SOURCE: i32 = -1;
/// Stability header word (`B_PACK_CHARS('S','Y','S','T')`), Android 12/12L.
const INTERFACE_HEADER: i32 = 0x5359_5354;

/// Presence marker for nullable parcelables.
const NULL_PARCELABLE: i32 = 0;
const NONNULL_PARCELABLE: i32 = 1;

const FLAT_OBJECT_SIZE: usize = 24;

#[derive(Debug, Default, Clone)]
pub struct Parcel {
    data: Vec<u8>,
    /// Byte offsets of flat_binder_object records inside `data`.
    objects: Vec<u64>,
    cursor: usize,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParcelError {
    #[error("parcel exhausted at offset {0}")]
    Exhausted(usize),
    #[error("malformed UTF-16 string in parcel")]
    BadString,
}

pub type ReadResult<T> = std::result::Result<T, ParcelError>;

impl Parcel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap bytes received from the kernel for reading.
    pub fn from_bytes(data: Vec<u8>, objects: Vec<u64>) -> Self {
        Self { data, objects, cursor: 0 }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn objects(&self) -> &[u64] {
        &self.objects
    }

    fn pad(&mut self) {
        while self.data.len() % 4 != 0 {
            self.data.push(0);
        }
    }

    // --- writers ---

    pub fn write_i32(&mut self, value: i32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Booleans and bytes both occupy a full word on the wire.
    pub fn write_bool(&mut self, value: bool) {
        self.write_i32(value as i32);
    }

    pub fn write_byte(&mut self, value: u8) {
        self.write_i32(value as i32);
    }

    pub fn write_string16(&mut self, value: Option<&str>) {
        match value {
            None => self.write_i32(-1),
            Some(s) => {
                let units: Vec<u16> = s.encode_utf16().collect();
                self.write_i32(units.len() as i32);
                for unit in &units {
                    self.data.extend_from_slice(&unit.to_le_bytes());
                }
                self.data.extend_from_slice(&0u16.to_le_bytes());
                self.pad();
            }
        }
    }

    pub fn write_byte_array(&mut self, value: Option<&[u8]>) {
        match value {
            None => self.write_i32(-1),
            Some(bytes) => {
                self.write_i32(bytes.len() as i32);
                self.data.extend_from_slice(bytes);
                self.pad();
            }
        }
    }

    pub fn write_null_parcelable(&mut self) {
        self.write_i32(NULL_PARCELABLE);
    }

    pub fn write_parcelable_header(&mut self) {
        self.write_i32(NONNULL_PARCELABLE);
    }

    /// RPC header preceding the interface name; layout depends on the
    /// negotiated protocol generation.
    pub fn write_interface_token(&mut self, protocol: BinderProtocol, interface: &str) {
        match protocol {
            BinderProtocol::Aidl1 => {}
            BinderProtocol::Aidl2 => {
                self.write_i32(STRICT_MODE_PENALTY_GATHER);
            }
            BinderProtocol::Aidl3 => {
                self.write_i32(STRICT_MODE_PENALTY_GATHER);
                self.write_i32(UNSET_WORK_SOURCE);
            }
            BinderProtocol::Aidl4 => {
                self.write_i32(STRICT_MODE_PENALTY_GATHER);
                self.write_i32(UNSET_WORK_SOURCE);
                self.write_i32(INTERFACE_HEADER);
            }
        }
        self.write_string16(Some(interface));
    }

    fn write_flat_object(&mut self, object_type: u32, value: u64, cookie: u64) {
        self.pad();
        self.objects.push(self.data.len() as u64);
        self.write_u32(object_type);
        self.write_u32(FLAT_BINDER_PRIORITY_MASK | FLAT_BINDER_FLAG_ACCEPTS_FDS);
        self.write_u64(value);
        self.write_u64(cookie);
    }

    /// A local object, identified to the kernel by its stable pointer.
    pub fn write_local_binder(&mut self, ptr: u64) {
        self.write_flat_object(BINDER_TYPE_BINDER, ptr, ptr);
    }

    /// A remote object previously received as a handle.
    pub fn write_handle(&mut self, handle: u32) {
        self.write_flat_object(BINDER_TYPE_HANDLE, handle as u64, 0);
    }

    // --- readers ---

    fn take(&mut self, n: usize) -> ReadResult<&[u8]> {
        if self.cursor + n > self.data.len() {
            return Err(ParcelError::Exhausted(self.cursor));
        }
        let slice = &self.data[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(slice)
    }

    fn align(&mut self) {
        self.cursor = (self.cursor + 3) & !3;
    }

    pub fn read_i32(&mut self) -> ReadResult<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u32(&mut self) -> ReadResult<u32> {
        Ok(self.read_i32()? as u32)
    }

    pub fn read_i64(&mut self) -> ReadResult<i64> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(buf))
    }

    pub fn read_bool(&mut self) -> ReadResult<bool> {
        Ok(self.read_i32()? != 0)
    }

    pub fn read_byte(&mut self) -> ReadResult<u8> {
        Ok(self.read_i32()? as u8)
    }

    pub fn read_string16(&mut self) -> ReadResult<Option<String>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        let bytes = self.take(len as usize * 2 + 2)?;
        let units: Vec<u16> = bytes[..len as usize * 2]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        self.align();
        String::from_utf16(&units)
            .map(Some)
            .map_err(|_| ParcelError::BadString)
    }

    pub fn read_byte_array(&mut self) -> ReadResult<Option<Vec<u8>>> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        let bytes = self.take(len as usize)?.to_vec();
        self.align();
        Ok(Some(bytes))
    }

    /// True when the next nullable parcelable is present.
    pub fn read_parcelable_present(&mut self) -> ReadResult<bool> {
        Ok(self.read_i32()? != NULL_PARCELABLE)
    }

    /// Read a flat_binder_object and return the contained handle. Local
    /// binder records (as opposed to handles) never arrive at this side.
    pub fn read_object_handle(&mut self) -> ReadResult<Option<u32>> {
        self.align();
        let start = self.cursor;
        let object_type = self.read_u32()?;
        let _flags = self.read_u32()?;
        let value = self.read_i64()? as u64;
        let _cookie = self.read_i64()?;
        debug_assert_eq!(self.cursor - start, FLAT_OBJECT_SIZE);
        match object_type {
            BINDER_TYPE_HANDLE if value != 0 => Ok(Some(value as u32)),
            BINDER_TYPE_HANDLE | BINDER_TYPE_BINDER => Ok(None),
            other => {
                tracing::warn!("unexpected binder object type {other:#x}");
                Ok(None)
            }
        }
    }

    /// Verify and consume the incoming RPC header of a server-side request.
    pub fn read_interface_token(&mut self, protocol: BinderProtocol) -> ReadResult<Option<String>> {
        match protocol {
            BinderProtocol::Aidl1 => {}
            BinderProtocol::Aidl2 => {
                let _strict = self.read_i32()?;
            }
            BinderProtocol::Aidl3 => {
                let _strict = self.read_i32()?;
                let _work_source = self.read_i32()?;
            }
            BinderProtocol::Aidl4 => {
                let _strict = self.read_i32()?;
                let _work_source = self.read_i32()?;
                let _header = self.read_i32()?;
            }
        }
        self.read_string16()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_round_trip() {
        let mut p = Parcel::new();
        p.write_i32(-5);
        p.write_i64(1 << 40);
        p.write_bool(true);
        p.write_byte(0xfe);

        assert_eq!(p.read_i32(), Ok(-5));
        assert_eq!(p.read_i64(), Ok(1 << 40));
        assert_eq!(p.read_bool(), Ok(true));
        assert_eq!(p.read_byte(), Ok(0xfe));
        assert!(matches!(p.read_i32(), Err(ParcelError::Exhausted(_))));
    }

    #[test]
    fn string16_layout_is_prefixed_terminated_padded() {
        let mut p = Parcel::new();
        p.write_string16(Some("abc"));
        // length 3, 'a' 'b' 'c', NUL; 12 bytes is already word aligned
        assert_eq!(
            p.data(),
            &[
                3, 0, 0, 0, // length in code units
                b'a', 0, b'b', 0, b'c', 0, // UTF-16LE
                0, 0, // terminator
            ]
        );
        assert_eq!(p.read_string16(), Ok(Some("abc".into())));

        // An even-length string needs the trailing pad.
        let mut p = Parcel::new();
        p.write_string16(Some("ab"));
        assert_eq!(p.data().len(), 12); // 4 + 4 + 2 terminator + 2 pad
        assert_eq!(p.read_string16(), Ok(Some("ab".into())));
    }

    #[test]
    fn null_string_is_minus_one() {
        let mut p = Parcel::new();
        p.write_string16(None);
        assert_eq!(p.data(), &(-1i32).to_le_bytes());
        assert_eq!(p.read_string16(), Ok(None));
    }

    #[test]
    fn non_ascii_survives_utf16() {
        let mut p = Parcel::new();
        p.write_string16(Some("Ünïcode 🎉"));
        assert_eq!(p.read_string16(), Ok(Some("Ünïcode 🎉".into())));
    }

    #[test]
    fn interface_token_grows_with_protocol() {
        let token_len = |protocol| {
            let mut p = Parcel::new();
            p.write_interface_token(protocol, "lineageos.waydroid.IPlatform");
            p.data().len()
        };
        let v1 = token_len(BinderProtocol::Aidl1);
        let v2 = token_len(BinderProtocol::Aidl2);
        let v3 = token_len(BinderProtocol::Aidl3);
        let v4 = token_len(BinderProtocol::Aidl4);
        assert_eq!(v2, v1 + 4);
        assert_eq!(v3, v2 + 4);
        assert_eq!(v4, v3 + 4);
    }

    #[test]
    fn interface_token_round_trips_per_protocol() {
        for protocol in [
            BinderProtocol::Aidl1,
            BinderProtocol::Aidl2,
            BinderProtocol::Aidl3,
            BinderProtocol::Aidl4,
        ] {
            let mut p = Parcel::new();
            p.write_interface_token(protocol, "lineageos.waydroid.IClipboard");
            assert_eq!(
                p.read_interface_token(protocol),
                Ok(Some("lineageos.waydroid.IClipboard".into())),
                "{protocol:?}"
            );
        }
    }

    #[test]
    fn objects_are_recorded_with_offsets() {
        let mut p = Parcel::new();
        p.write_i32(7);
        p.write_handle(42);
        assert_eq!(p.objects(), &[4]);
        assert_eq!(p.data().len(), 4 + 24);

        assert_eq!(p.read_i32(), Ok(7));
        assert_eq!(p.read_object_handle(), Ok(Some(42)));
    }

    #[test]
    fn byte_array_round_trip() {
        let mut p = Parcel::new();
        p.write_byte_array(Some(&[1, 2, 3, 4, 5]));
        p.write_byte_array(None);
        assert_eq!(p.read_byte_array(), Ok(Some(vec![1, 2, 3, 4, 5])));
        assert_eq!(p.read_byte_array(), Ok(None));
    }

    #[test]
    fn nullable_parcelable_flags() {
        let mut p = Parcel::new();
        p.write_null_parcelable();
        p.write_parcelable_header();
        assert_eq!(p.read_parcelable_present(), Ok(false));
        assert_eq!(p.read_parcelable_present(), Ok(true));
    }
}

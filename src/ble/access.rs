//! Characteristic Access Dispatch
//!
//! Validates read/write requests against the registered characteristic and
//! invokes its [`AccessHandler`]. The session engine runs these helpers
//! outside its lock, so handlers may perform external side effects.

use heapless::Vec;

use crate::ble::registry::RegisteredCharacteristic;
use crate::config::MAX_VALUE_LEN;

/// Bounded value buffer shared by reads, writes and backing storage
pub type ValueBuffer = Vec<u8, MAX_VALUE_LEN>;

/// Failure reported by an access handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HandlerError {
    /// Rendered value does not fit the response buffer
    Overflow,
    /// Payload is well-formed but not acceptable
    Rejected,
}

/// Per-characteristic read/write behaviour
///
/// Write side effects must be idempotent: applying the same payload twice
/// leaves the system in the same state as applying it once.
pub trait AccessHandler: Sync {
    /// Render the current value into `out`. `stored` is the backing value.
    fn read(&self, stored: &[u8], out: &mut ValueBuffer) -> Result<(), HandlerError> {
        out.extend_from_slice(stored).map_err(|_| HandlerError::Overflow)
    }

    /// Apply a validated write payload.
    fn write(&self, data: &[u8]) -> Result<(), HandlerError> {
        let _ = data;
        Ok(())
    }
}

/// Handler that serves the backing value and accepts every write
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

impl AccessHandler for DefaultHandler {}

/// Attribute access operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AccessOp {
    Read,
    Write,
}

/// Access request carried by a host event
#[derive(Debug)]
pub enum Access<'b> {
    Read { out: &'b mut ValueBuffer },
    Write { data: &'b [u8] },
}

/// Access rejection, mapped onto ATT error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AccessError {
    AttributeNotFound,
    OperationNotPermitted(AccessOp),
    InvalidLength,
    InsufficientResources,
    ValueNotAllowed,
}

impl AccessError {
    /// ATT protocol error code returned to the client
    pub const fn att_error_code(self) -> u8 {
        match self {
            // Unknown handles are reported as "unlikely error"
            AccessError::AttributeNotFound => 0x0E,
            AccessError::OperationNotPermitted(AccessOp::Read) => 0x02,
            AccessError::OperationNotPermitted(AccessOp::Write) => 0x03,
            AccessError::InvalidLength => 0x0D,
            AccessError::InsufficientResources => 0x11,
            AccessError::ValueNotAllowed => 0x13,
        }
    }
}

impl From<HandlerError> for AccessError {
    fn from(e: HandlerError) -> Self {
        match e {
            HandlerError::Overflow => AccessError::InsufficientResources,
            HandlerError::Rejected => AccessError::ValueNotAllowed,
        }
    }
}

/// Check the request shape against the declared properties and width.
pub fn validate(characteristic: &RegisteredCharacteristic<'_>, access: &Access<'_>) -> Result<(), AccessError> {
    match access {
        Access::Read { .. } => {
            if !characteristic.properties.can_read() {
                return Err(AccessError::OperationNotPermitted(AccessOp::Read));
            }
        }
        Access::Write { data } => {
            if !characteristic.properties.can_write() {
                return Err(AccessError::OperationNotPermitted(AccessOp::Write));
            }
            if data.len() != characteristic.width as usize {
                return Err(AccessError::InvalidLength);
            }
        }
    }
    Ok(())
}

/// Render a read through the characteristic's handler.
pub fn render_read(
    characteristic: &RegisteredCharacteristic<'_>,
    stored: &[u8],
    out: &mut ValueBuffer,
) -> Result<(), AccessError> {
    out.clear();
    characteristic.handler.read(stored, out).map_err(AccessError::from)
}

/// Hand a validated write payload to the characteristic's handler.
pub fn apply_write(characteristic: &RegisteredCharacteristic<'_>, data: &[u8]) -> Result<(), AccessError> {
    characteristic.handler.write(data).map_err(AccessError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::registry::{BleUuid, Properties};

    struct Picky;

    impl AccessHandler for Picky {
        fn write(&self, data: &[u8]) -> Result<(), HandlerError> {
            if data[0] > 1 {
                Err(HandlerError::Rejected)
            } else {
                Ok(())
            }
        }
    }

    static PICKY: Picky = Picky;
    static PLAIN: DefaultHandler = DefaultHandler;

    fn characteristic(
        properties: Properties,
        width: u8,
        handler: &'static dyn AccessHandler,
    ) -> RegisteredCharacteristic<'static> {
        RegisteredCharacteristic {
            service_handle: 1,
            uuid: BleUuid::Uuid16(0x2A00),
            properties,
            width,
            def_handle: 2,
            value_handle: 3,
            cccd_handle: None,
            handler,
        }
    }

    #[test]
    fn error_codes_match_att() {
        assert_eq!(AccessError::AttributeNotFound.att_error_code(), 0x0E);
        assert_eq!(AccessError::OperationNotPermitted(AccessOp::Read).att_error_code(), 0x02);
        assert_eq!(AccessError::OperationNotPermitted(AccessOp::Write).att_error_code(), 0x03);
        assert_eq!(AccessError::InvalidLength.att_error_code(), 0x0D);
        assert_eq!(AccessError::InsufficientResources.att_error_code(), 0x11);
        assert_eq!(AccessError::ValueNotAllowed.att_error_code(), 0x13);
    }

    #[test]
    fn write_to_read_only_is_not_permitted() {
        let c = characteristic(Properties::READ, 1, &PLAIN);
        let access = Access::Write { data: &[1] };
        assert_eq!(
            validate(&c, &access),
            Err(AccessError::OperationNotPermitted(AccessOp::Write))
        );
    }

    #[test]
    fn read_of_write_only_is_not_permitted() {
        let c = characteristic(Properties::WRITE, 1, &PLAIN);
        let mut out = ValueBuffer::new();
        let access = Access::Read { out: &mut out };
        assert_eq!(
            validate(&c, &access),
            Err(AccessError::OperationNotPermitted(AccessOp::Read))
        );
    }

    #[test]
    fn write_width_must_match_exactly() {
        let c = characteristic(Properties::WRITE, 1, &PLAIN);
        assert_eq!(validate(&c, &Access::Write { data: &[] }), Err(AccessError::InvalidLength));
        assert_eq!(validate(&c, &Access::Write { data: &[1, 2] }), Err(AccessError::InvalidLength));
        assert_eq!(validate(&c, &Access::Write { data: &[1] }), Ok(()));
    }

    #[test]
    fn handler_rejection_maps_to_value_not_allowed() {
        let c = characteristic(Properties::WRITE, 1, &PICKY);
        assert_eq!(apply_write(&c, &[2]), Err(AccessError::ValueNotAllowed));
        assert_eq!(apply_write(&c, &[1]), Ok(()));
    }

    #[test]
    fn default_read_copies_backing_value() {
        let c = characteristic(Properties::READ, 2, &PLAIN);
        let mut out = ValueBuffer::new();
        out.push(0xAA).unwrap();
        render_read(&c, &[0x00, 0x48], &mut out).unwrap();
        assert_eq!(&out[..], &[0x00, 0x48]);
    }
}

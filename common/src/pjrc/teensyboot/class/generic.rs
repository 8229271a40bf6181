use std::time::Duration;

use crate::pjrc::teensyboot::board::{BoardState, Interface};
use crate::pjrc::teensyboot::class::{Capabilities, DeviceClass, InterfaceDetails};
use crate::pjrc::teensyboot::device::{Device, DevicePort, DeviceType};
use crate::pjrc::teensyboot::message::report;
use crate::pjrc::teensyboot::model::Model;
use crate::pjrc::teensyboot::{Error, Result};

const SERIAL_WRITE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Board ids keep to this alphabet, everything else becomes an underscore.
fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | ':' | '.' => ch,
            _ => '_',
        })
        .collect()
}

///
/// Catch-all class for USB serial adapters.
///
/// Such boards only support serial I/O; their identity comes from the USB strings alone,
/// so two different devices on one port are told apart by serial number, product and
/// manufacturer.
///
pub struct GenericClass;

impl DeviceClass for GenericClass {
    fn name(&self) -> &'static str {
        "Generic"
    }

    fn load_interface(&self, dev: &Device) -> Result<Option<InterfaceDetails>> {
        if dev.dev_type != DeviceType::Serial {
            return Ok(None);
        }

        Ok(Some(InterfaceDetails {
            name: "Serial",
            capabilities: Capabilities::SERIAL,
            model: Model::Generic,
        }))
    }

    fn update_board(&self, iface: &Interface, state: &mut BoardState, _new_board: bool) -> Result<bool> {
        let dev = iface.device();

        let manufacturer = dev.manufacturer.as_deref().unwrap_or("Unknown");
        let product = dev.product.as_deref().unwrap_or("Unknown");
        let serial_number = dev.serial_number.as_deref().unwrap_or("?");

        if state.model != Model::Generic {
            return Ok(false);
        }

        if let Some(board_serial) = &state.serial_number {
            if board_serial != serial_number {
                return Ok(false);
            }
        }

        // Does the serial number look like it identifies anything?
        let unique = dev
            .serial_number
            .as_deref()
            .is_some_and(|serial| !serial.trim_start_matches(['0', '_', ' ']).is_empty());

        if let Some(description) = &state.description {
            if description != product {
                return Ok(false);
            }
        }

        let id = sanitize_id(&format!("{}-{}", serial_number, manufacturer));
        if !state.id.is_empty() && state.id != id {
            return Ok(false);
        }

        // Everything is alright, we can commit the changes
        state.serial_number = Some(serial_number.to_string());
        if unique {
            iface.add_capabilities(Capabilities::UNIQUE);
        }
        state.description = Some(product.to_string());
        if state.id.is_empty() {
            state.id = id;
        }

        Ok(true)
    }

    fn open_interface(&self, iface: &Interface) -> Result<Box<dyn DevicePort>> {
        iface.opener().open(iface.device())
    }

    fn serial_read(&self, iface: &Interface, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let port = iface.port()?;
        let mut port = port.lock().unwrap();
        port.read(buf, timeout)
    }

    fn serial_write(&self, iface: &Interface, buf: &[u8]) -> Result<usize> {
        let port = iface.port()?;
        let mut port = port.lock().unwrap();

        let sent = port.write(buf, Some(SERIAL_WRITE_TIMEOUT))?;
        if sent == 0 {
            return Err(report(Error::Io(format!(
                "Timed out while writing to '{}'",
                iface.path()
            ))));
        }
        Ok(sent)
    }
}

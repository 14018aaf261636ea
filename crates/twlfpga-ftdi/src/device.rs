//! FT2232H board implementation
//!
//! [`FtdiBoard`] claims both bridge channels and implements
//! [`Transport`]. IN transfers are queued on the `nusb` endpoint, which
//! completes them in submission order.

use std::time::Duration;

use nusb::transfer::{Buffer, Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient};
use nusb::{Device, DeviceInfo, Endpoint, Interface, MaybeFuture};
use twlfpga_core::transport::TransportResult;
use twlfpga_core::{BitMode, Channel, Transport};

use crate::error::{FtdiError, Result};
use crate::protocol::*;

/// One claimed bridge channel
struct Port {
    channel: Channel,
    interface: Interface,
    in_ep: Endpoint<Bulk, In>,
    out_ep: Endpoint<Bulk, Out>,
}

impl Port {
    fn claim(device: &Device, channel: Channel) -> Result<Self> {
        let (iface, in_addr, out_addr) = match channel {
            Channel::A => (INTERFACE_A, EP_IN_A, EP_OUT_A),
            Channel::B => (INTERFACE_B, EP_IN_B, EP_OUT_B),
        };

        let interface = device
            .detach_and_claim_interface(iface)
            .wait()
            .map_err(|e| FtdiError::ClaimFailed(format!("interface {}: {}", iface, e)))?;
        let in_ep = interface
            .endpoint::<Bulk, In>(in_addr)
            .map_err(|e| FtdiError::ClaimFailed(e.to_string()))?;
        let out_ep = interface
            .endpoint::<Bulk, Out>(out_addr)
            .map_err(|e| FtdiError::ClaimFailed(e.to_string()))?;

        log::debug!(
            "Channel {}: interface {}, IN 0x{:02X}, OUT 0x{:02X}, {} byte packets",
            channel,
            iface,
            in_addr,
            out_addr,
            in_ep.max_packet_size()
        );

        Ok(Self {
            channel,
            interface,
            in_ep,
            out_ep,
        })
    }

    /// SIO request addressed to this channel
    fn sio_out(&self, request: u8, value: u16) -> Result<()> {
        self.control_out(request, value, self.channel.sio_index())
    }

    fn control_out(&self, request: u8, value: u16, index: u16) -> Result<()> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index,
                    data: &[],
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|e| FtdiError::transfer(format!("request 0x{:02X}", request), e))
    }

    fn control_in(&self, request: u8, index: u16, length: u16) -> Result<Vec<u8>> {
        self.interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value: 0,
                    index,
                    length,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|e| FtdiError::transfer(format!("request 0x{:02X}", request), e))
    }
}

/// The twlfpga board's FT2232H bridge
pub struct FtdiBoard {
    /// Claimed channels A and B; `None` once released
    ports: Option<[Port; 2]>,
    max_packet_size: usize,
    vendor_id: u16,
    product_id: u16,
}

impl FtdiBoard {
    /// Open the first attached board
    ///
    /// A board with the twlfpga identity is preferred over a blank FT2232H.
    /// Both channels are claimed, reset and given a 2 ms latency timer.
    pub fn open() -> Result<Self> {
        let info = find_board()?;

        log::info!(
            "Opening {:04X}:{:04X} at bus {} address {}",
            info.vendor_id(),
            info.product_id(),
            info.bus_id(),
            info.device_address()
        );

        let device = info
            .open()
            .wait()
            .map_err(|e| FtdiError::OpenFailed(e.to_string()))?;

        let ports = [
            Port::claim(&device, Channel::A)?,
            Port::claim(&device, Channel::B)?,
        ];
        for port in &ports {
            port.sio_out(SIO_RESET, SIO_RESET_SIO)?;
            port.sio_out(SIO_SET_LATENCY_TIMER, LATENCY_TIMER_MS)?;
        }
        let max_packet_size = ports[0].in_ep.max_packet_size();

        Ok(Self {
            ports: Some(ports),
            max_packet_size,
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
        })
    }

    /// USB identity of the opened device
    pub fn usb_id(&self) -> (u16, u16) {
        (self.vendor_id, self.product_id)
    }

    fn port(&self, channel: Channel) -> Result<&Port> {
        let ports = self.ports.as_ref().ok_or(FtdiError::Released)?;
        Ok(&ports[channel_slot(channel)])
    }

    fn port_mut(&mut self, channel: Channel) -> Result<&mut Port> {
        let ports = self.ports.as_mut().ok_or(FtdiError::Released)?;
        Ok(&mut ports[channel_slot(channel)])
    }
}

/// Open the board as a session transport
pub fn connect() -> TransportResult<FtdiBoard> {
    Ok(FtdiBoard::open()?)
}

fn channel_slot(channel: Channel) -> usize {
    match channel {
        Channel::A => 0,
        Channel::B => 1,
    }
}

fn find_board() -> Result<DeviceInfo> {
    let devices: Vec<DeviceInfo> = nusb::list_devices().wait()?.collect();

    SUPPORTED_IDS
        .iter()
        .find_map(|&(vid, pid)| {
            devices
                .iter()
                .find(|d| d.vendor_id() == vid && d.product_id() == pid)
                .cloned()
        })
        .ok_or(FtdiError::DeviceNotFound)
}

impl Transport for FtdiBoard {
    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn set_bitmode(&mut self, channel: Channel, mode: BitMode, mask: u8) -> TransportResult<()> {
        log::debug!("Channel {}: bitmode {:?}, mask 0x{:02X}", channel, mode, mask);
        let value = ((mode.bits() as u16) << 8) | mask as u16;
        Ok(self.port(channel)?.sio_out(SIO_SET_BITMODE, value)?)
    }

    fn purge_rx(&mut self, channel: Channel) -> TransportResult<()> {
        Ok(self.port(channel)?.sio_out(SIO_RESET, SIO_RESET_PURGE_RX)?)
    }

    fn read_pins(&mut self, channel: Channel) -> TransportResult<u8> {
        let port = self.port(channel)?;
        let data = port.control_in(SIO_READ_PINS, channel.sio_index(), 1)?;
        let pins = *data
            .first()
            .ok_or(FtdiError::ShortRead("SIO_READ_PINS"))?;
        Ok(pins)
    }

    fn write(&mut self, channel: Channel, data: &[u8]) -> TransportResult<()> {
        let port = self.port_mut(channel)?;
        let mut buf = Buffer::new(data.len());
        buf.extend_from_slice(data);
        port.out_ep
            .transfer_blocking(buf, WRITE_TIMEOUT)
            .into_result()
            .map_err(|e| FtdiError::transfer(format!("bulk write on channel {}", channel), e))?;
        log::trace!("Channel {}: wrote {} bytes", channel, data.len());
        Ok(())
    }

    fn read_eeprom(&mut self, addr: u8) -> TransportResult<u16> {
        let data = self
            .port(Channel::A)?
            .control_in(SIO_READ_EEPROM, addr as u16, 2)?;
        if data.len() < 2 {
            return Err(FtdiError::ShortRead("SIO_READ_EEPROM").into());
        }
        Ok(u16::from_le_bytes([data[0], data[1]]))
    }

    fn write_eeprom(&mut self, addr: u8, word: u16) -> TransportResult<()> {
        Ok(self
            .port(Channel::A)?
            .control_out(SIO_WRITE_EEPROM, word, addr as u16)?)
    }

    fn submit_read(&mut self, channel: Channel, len: usize) -> TransportResult<()> {
        let port = self.port_mut(channel)?;
        let mut buf = Buffer::new(len);
        buf.set_requested_len(len);
        port.in_ep.submit(buf);
        Ok(())
    }

    fn wait_read(
        &mut self,
        channel: Channel,
        timeout: Duration,
    ) -> Option<TransportResult<Vec<u8>>> {
        let port = match self.port_mut(channel) {
            Ok(port) => port,
            Err(e) => return Some(Err(e.into())),
        };
        if port.in_ep.pending() == 0 {
            return None;
        }
        let completion = port.in_ep.wait_next_complete(timeout)?;
        Some(
            completion
                .into_result()
                .map(|buf| buf.to_vec())
                .map_err(|e| FtdiError::transfer(format!("bulk read on channel {}", channel), e).into()),
        )
    }

    fn cancel_reads(&mut self, channel: Channel) {
        if let Ok(port) = self.port_mut(channel) {
            port.in_ep.cancel_all();
        }
    }

    fn pending_reads(&self, channel: Channel) -> usize {
        self.port(channel).map(|port| port.in_ep.pending()).unwrap_or(0)
    }

    fn release(&mut self) {
        if let Some(mut ports) = self.ports.take() {
            for port in &mut ports {
                port.in_ep.cancel_all();
            }
            let (vid, pid) = self.usb_id();
            log::debug!("Released {:04X}:{:04X}", vid, pid);
        }
    }
}

impl Drop for FtdiBoard {
    fn drop(&mut self) {
        self.release();
    }
}

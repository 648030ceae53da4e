//! The USB descriptor structures the enumeration path walks. Packed
//! little-endian on the wire; the u16 fields are read unaligned.

use super::context::EndpointType;

pub const USB_DESCRIPTOR_DEVICE: u8 = 1;
pub const USB_DESCRIPTOR_CONFIGURATION: u8 = 2;
pub const USB_DESCRIPTOR_STRING: u8 = 3;
pub const USB_DESCRIPTOR_INTERFACE: u8 = 4;
pub const USB_DESCRIPTOR_ENDPOINT: u8 = 5;
pub const USB_DESCRIPTOR_HUB: u8 = 0x29;
pub const USB_DESCRIPTOR_BOS: u8 = 0xF;

pub const REQUEST_GET_DESCRIPTOR: u8 = 6;
pub const REQUEST_SET_CONFIGURATION: u8 = 9;

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct UsbDescriptorHeader {
    pub b_length: u8,
    pub b_descriptor_type: u8,
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct UsbDeviceDescriptor {
    pub header: UsbDescriptorHeader,
    pub bcd_usb: u16,
    pub b_device_class: u8,
    pub b_device_subclass: u8,
    pub b_device_protocol: u8,
    pub b_max_packet_size_0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub num_configurations: u8,
}

const _: () = assert!(size_of::<UsbDeviceDescriptor>() == 18);

pub const USB_CLASS_HUB: u8 = 0x09;

impl UsbDeviceDescriptor {
    pub const fn zeroed() -> Self {
        unsafe { core::mem::zeroed() }
    }

    pub fn is_hub(&self) -> bool {
        self.b_device_class == USB_CLASS_HUB
    }

    /// USB revisions at or past 2.10 carry a BOS descriptor.
    pub fn has_bos(&self) -> bool {
        self.bcd_usb >= 0x210
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct UsbConfigurationDescriptor {
    pub header: UsbDescriptorHeader,
    pub w_total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub i_configuration: u8,
    pub bm_attributes: u8,
    pub b_max_power: u8,
}

const _: () = assert!(size_of::<UsbConfigurationDescriptor>() == 9);

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct UsbInterfaceDescriptor {
    pub header: UsbDescriptorHeader,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub i_interface: u8,
}

const _: () = assert!(size_of::<UsbInterfaceDescriptor>() == 9);

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct UsbEndpointDescriptor {
    pub header: UsbDescriptorHeader,
    pub endpoint_address: u8,
    pub bm_attributes: u8,
    pub max_packet_size: u16,
    pub b_interval: u8,
}

const _: () = assert!(size_of::<UsbEndpointDescriptor>() == 7);

impl UsbEndpointDescriptor {
    pub const fn endpoint_number(&self) -> u8 {
        self.endpoint_address & 0xF
    }

    pub const fn is_in(&self) -> bool {
        self.endpoint_address & 0x80 != 0
    }

    pub const fn endpoint_type(&self) -> EndpointType {
        match (self.bm_attributes & 0x3, self.is_in()) {
            (0, _) => EndpointType::Control,
            (1, false) => EndpointType::IsochOut,
            (1, true) => EndpointType::IsochIn,
            (2, false) => EndpointType::BulkOut,
            (2, true) => EndpointType::BulkIn,
            (3, false) => EndpointType::InterruptOut,
            (3, true) => EndpointType::InterruptIn,
            _ => EndpointType::NotValid,
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct UsbBosDescriptor {
    pub header: UsbDescriptorHeader,
    pub w_total_length: u16,
    pub num_device_caps: u8,
}

const _: () = assert!(size_of::<UsbBosDescriptor>() == 5);

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct UsbHubDescriptor {
    pub header: UsbDescriptorHeader,
    pub num_ports: u8,
    pub characteristics: u16,
    pub power_on_to_good_ms: u8,
    pub hub_current: u8,
}

/// Walks the interface and endpoint descriptors packed behind a
/// configuration descriptor.
pub struct DescriptorWalker<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> DescriptorWalker<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    /// The next descriptor's (type, body bytes including the header).
    pub fn next_descriptor(&mut self) -> Option<(u8, &'a [u8])> {
        let rest = self.bytes.get(self.offset..)?;
        if rest.len() < size_of::<UsbDescriptorHeader>() {
            return None;
        }

        let len = rest[0] as usize;
        let kind = rest[1];
        if len < 2 || rest.len() < len {
            return None;
        }

        self.offset += len;
        Some((kind, &rest[..len]))
    }

    /// All endpoint descriptors in the configuration blob.
    pub fn endpoints(mut self) -> alloc::vec::Vec<UsbEndpointDescriptor> {
        let mut out = alloc::vec::Vec::new();
        while let Some((kind, bytes)) = self.next_descriptor() {
            if kind == USB_DESCRIPTOR_ENDPOINT && bytes.len() >= size_of::<UsbEndpointDescriptor>()
            {
                let mut desc = UsbEndpointDescriptor {
                    header: UsbDescriptorHeader {
                        b_length: bytes[0],
                        b_descriptor_type: bytes[1],
                    },
                    endpoint_address: bytes[2],
                    bm_attributes: bytes[3],
                    max_packet_size: 0,
                    b_interval: bytes[6],
                };
                desc.max_packet_size = u16::from_le_bytes([bytes[4], bytes[5]]);
                out.push(desc);
            }
        }
        out
    }
}

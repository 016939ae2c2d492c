//! Descriptor model and marshalling
//!
//! A [`Device`] is built once by the caller and borrowed by
//! [`Session::open`](crate::Session::open), which validates it and turns it
//! into a [`DescriptorImage`]: the exact bytes the kernel expects at
//! registration time plus the lookup tables the session needs afterwards
//! (endpoint descriptors per speed, encoded string descriptors).
//!
//! Configuration sets keep the classic layout: one configuration descriptor,
//! then its interface and endpoint descriptors, closed by
//! [`DescriptorBlock::End`].

use crate::error::{GadgetError, Result};
use crate::event::Speed;
use byteorder::{ByteOrder, LittleEndian};
use std::collections::{BTreeMap, HashSet};

/// Descriptor type codes
pub const DT_DEVICE: u8 = 0x01;
pub const DT_CONFIG: u8 = 0x02;
pub const DT_STRING: u8 = 0x03;
pub const DT_INTERFACE: u8 = 0x04;
pub const DT_ENDPOINT: u8 = 0x05;

/// Fixed descriptor sizes
pub const DT_DEVICE_SIZE: usize = 18;
pub const DT_CONFIG_SIZE: usize = 9;
pub const DT_INTERFACE_SIZE: usize = 9;
pub const DT_ENDPOINT_SIZE: usize = 7;
/// Audio endpoints carry two extra bytes (bRefresh, bSynchAddress)
pub const DT_ENDPOINT_AUDIO_SIZE: usize = 9;

pub const USB_DIR_IN: u8 = 0x80;
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0f;
pub const ENDPOINT_XFERTYPE_MASK: u8 = 0x03;
pub const ENDPOINT_XFER_BULK: u8 = 0x02;

pub const CLASS_VENDOR_SPEC: u8 = 0xff;

pub const CONFIG_ATT_ONE: u8 = 0x80;
pub const CONFIG_ATT_SELFPOWER: u8 = 0x40;

/// US English, the usual default string language
pub const LANG_EN_US: u16 = 0x0409;

/// Longest string a descriptor can carry, in UTF-16 code units
const MAX_STRING_UNITS: usize = (u8::MAX as usize - 2) / 2;

/// Leading tag of the gadgetfs device configuration write
const GADGETFS_DEVICE_TAG: u32 = 0;
/// Leading tag of the gadgetfs endpoint configuration write
const GADGETFS_ENDPOINT_TAG: u32 = 1;

/// Standard device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// USB specification release (BCD, e.g. 0x0200)
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    /// Control endpoint packet size; 0 lets the controller fill it in
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Device release number (BCD)
    pub bcd_device: u16,
    /// String index of the manufacturer name
    pub manufacturer: u8,
    /// String index of the product name
    pub product: u8,
    /// String index of the serial number
    pub serial_number: u8,
    pub num_configurations: u8,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self {
            bcd_usb: 0x0200,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            max_packet_size0: 0,
            vendor_id: 0,
            product_id: 0,
            bcd_device: 0,
            manufacturer: 0,
            product: 0,
            serial_number: 0,
            num_configurations: 1,
        }
    }
}

impl DeviceDescriptor {
    /// Encode to the 18-byte wire form
    pub fn encode(&self) -> [u8; DT_DEVICE_SIZE] {
        let mut buf = [0u8; DT_DEVICE_SIZE];
        buf[0] = DT_DEVICE_SIZE as u8;
        buf[1] = DT_DEVICE;
        LittleEndian::write_u16(&mut buf[2..4], self.bcd_usb);
        buf[4] = self.device_class;
        buf[5] = self.device_subclass;
        buf[6] = self.device_protocol;
        buf[7] = self.max_packet_size0;
        LittleEndian::write_u16(&mut buf[8..10], self.vendor_id);
        LittleEndian::write_u16(&mut buf[10..12], self.product_id);
        LittleEndian::write_u16(&mut buf[12..14], self.bcd_device);
        buf[14] = self.manufacturer;
        buf[15] = self.product;
        buf[16] = self.serial_number;
        buf[17] = self.num_configurations;
        buf
    }
}

/// Configuration descriptor
///
/// `wTotalLength` is not stored; it is computed when the configuration set
/// is marshalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDescriptor {
    pub num_interfaces: u8,
    /// Value the host passes to SET_CONFIGURATION
    pub configuration_value: u8,
    /// String index describing this configuration
    pub configuration: u8,
    pub attributes: u8,
    /// Maximum bus power in 2 mA units
    pub max_power: u8,
}

impl ConfigDescriptor {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[
            DT_CONFIG_SIZE as u8,
            DT_CONFIG,
            0, // wTotalLength, patched later
            0,
            self.num_interfaces,
            self.configuration_value,
            self.configuration,
            self.attributes,
            self.max_power,
        ]);
    }

    fn parse(bytes: &[u8]) -> Self {
        Self {
            num_interfaces: bytes[4],
            configuration_value: bytes[5],
            configuration: bytes[6],
            attributes: bytes[7],
            max_power: bytes[8],
        }
    }
}

/// Interface descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    /// Number of endpoint descriptors that follow
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    /// String index naming this interface
    pub interface: u8,
}

impl InterfaceDescriptor {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[
            DT_INTERFACE_SIZE as u8,
            DT_INTERFACE,
            self.interface_number,
            self.alternate_setting,
            self.num_endpoints,
            self.interface_class,
            self.interface_subclass,
            self.interface_protocol,
            self.interface,
        ]);
    }

    fn parse(bytes: &[u8]) -> Self {
        Self {
            interface_number: bytes[2],
            alternate_setting: bytes[3],
            num_endpoints: bytes[4],
            interface_class: bytes[5],
            interface_subclass: bytes[6],
            interface_protocol: bytes[7],
            interface: bytes[8],
        }
    }
}

/// Endpoint descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Endpoint number plus direction bit ([`USB_DIR_IN`])
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    /// Bulk endpoint, device to host
    pub fn bulk_in(number: u8, max_packet_size: u16) -> Self {
        Self {
            address: USB_DIR_IN | (number & ENDPOINT_NUMBER_MASK),
            attributes: ENDPOINT_XFER_BULK,
            max_packet_size,
            interval: 0,
        }
    }

    /// Bulk endpoint, host to device
    pub fn bulk_out(number: u8, max_packet_size: u16) -> Self {
        Self {
            address: number & ENDPOINT_NUMBER_MASK,
            attributes: ENDPOINT_XFER_BULK,
            max_packet_size,
            interval: 0,
        }
    }

    /// Endpoint number without the direction bit
    pub fn number(&self) -> u8 {
        self.address & ENDPOINT_NUMBER_MASK
    }

    /// True for device-to-host endpoints
    pub fn is_in(&self) -> bool {
        self.address & USB_DIR_IN != 0
    }

    pub fn encode(&self) -> [u8; DT_ENDPOINT_SIZE] {
        let mut buf = [0u8; DT_ENDPOINT_SIZE];
        buf[0] = DT_ENDPOINT_SIZE as u8;
        buf[1] = DT_ENDPOINT;
        buf[2] = self.address;
        buf[3] = self.attributes;
        LittleEndian::write_u16(&mut buf[4..6], self.max_packet_size);
        buf[6] = self.interval;
        buf
    }

    fn parse(bytes: &[u8]) -> Self {
        Self {
            address: bytes[2],
            attributes: bytes[3],
            max_packet_size: LittleEndian::read_u16(&bytes[4..6]),
            interval: bytes[6],
        }
    }
}

/// One entry of a configuration set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorBlock {
    Config(ConfigDescriptor),
    Interface(InterfaceDescriptor),
    Endpoint(EndpointDescriptor),
    /// Pre-built descriptor bytes, starting with bLength and bDescriptorType
    ///
    /// Standard interface, endpoint and configuration descriptors supplied
    /// this way are decoded and validated like their typed counterparts;
    /// anything else (class-specific descriptors) is passed through.
    Raw(Vec<u8>),
    /// Terminates the set
    End,
}

/// One string of the string table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringEntry {
    pub id: u8,
    pub text: String,
}

/// Language-tagged string table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strings {
    pub language: u16,
    pub entries: Vec<StringEntry>,
}

impl Default for Strings {
    fn default() -> Self {
        Self::new(LANG_EN_US)
    }
}

impl Strings {
    pub fn new(language: u16) -> Self {
        Self {
            language,
            entries: Vec::new(),
        }
    }

    /// Add a string
    #[must_use]
    pub fn with(mut self, id: u8, text: impl Into<String>) -> Self {
        self.entries.push(StringEntry {
            id,
            text: text.into(),
        });
        self
    }
}

/// Complete description of a gadget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub device: DeviceDescriptor,
    /// Full-speed configuration set, terminated by [`DescriptorBlock::End`]
    pub full_speed: Vec<DescriptorBlock>,
    /// Optional high-speed configuration set, same layout
    pub high_speed: Option<Vec<DescriptorBlock>>,
    pub strings: Strings,
}

impl Device {
    /// Validate and marshal into a [`DescriptorImage`]
    pub fn marshal(&self) -> Result<DescriptorImage> {
        let strings = StringTable::build(&self.strings)?;

        if self.device.num_configurations != 1 {
            return Err(GadgetError::Validation(format!(
                "device declares {} configurations, exactly one is supported",
                self.device.num_configurations
            )));
        }
        for index in [
            self.device.manufacturer,
            self.device.product,
            self.device.serial_number,
        ] {
            strings.require(index, "device descriptor")?;
        }

        let full_speed = ConfigLayout::build(&self.full_speed, "full-speed", &strings)?;
        let high_speed = match &self.high_speed {
            Some(blocks) => {
                let hs = ConfigLayout::build(blocks, "high-speed", &strings)?;
                if hs.config.configuration_value != full_speed.config.configuration_value {
                    return Err(GadgetError::Validation(format!(
                        "high-speed configuration value {} differs from full-speed value {}",
                        hs.config.configuration_value, full_speed.config.configuration_value
                    )));
                }
                let fs_addrs: Vec<u8> = full_speed.endpoints.iter().map(|e| e.address).collect();
                let hs_addrs: Vec<u8> = hs.endpoints.iter().map(|e| e.address).collect();
                if fs_addrs != hs_addrs {
                    return Err(GadgetError::Validation(format!(
                        "high-speed endpoints {:02x?} do not match full-speed endpoints {:02x?}",
                        hs_addrs, fs_addrs
                    )));
                }
                Some(hs)
            }
            None => None,
        };

        Ok(DescriptorImage {
            device: self.device.encode(),
            full_speed,
            high_speed,
            strings,
        })
    }
}

/// A validated configuration set and its wire bytes
#[derive(Debug, Clone)]
pub struct ConfigLayout {
    pub config: ConfigDescriptor,
    /// Endpoints in descriptor order, first occurrence of each address
    pub endpoints: Vec<EndpointDescriptor>,
    /// Marshalled set with wTotalLength filled in
    pub bytes: Vec<u8>,
}

/// Tracks the interface whose endpoints are being counted
struct OpenInterface {
    number: u8,
    alternate: u8,
    declared: u8,
    seen: u8,
}

impl OpenInterface {
    fn finish(self, label: &str) -> Result<()> {
        if self.seen != self.declared {
            return Err(GadgetError::Validation(format!(
                "{} interface {} alt {} declares {} endpoints but {} follow",
                label, self.number, self.alternate, self.declared, self.seen
            )));
        }
        Ok(())
    }
}

impl ConfigLayout {
    fn build(blocks: &[DescriptorBlock], label: &str, strings: &StringTable) -> Result<Self> {
        let invalid = |msg: String| GadgetError::Validation(format!("{}: {}", label, msg));

        match blocks.iter().position(|b| matches!(b, DescriptorBlock::End)) {
            None => return Err(invalid("configuration set is missing its terminator".into())),
            Some(pos) if pos + 1 != blocks.len() => {
                return Err(invalid(format!(
                    "{} descriptors follow the terminator",
                    blocks.len() - pos - 1
                )));
            }
            Some(_) => {}
        }

        let mut bytes = Vec::with_capacity(64);
        let mut config: Option<ConfigDescriptor> = None;
        let mut current: Option<OpenInterface> = None;
        let mut interface_numbers = HashSet::new();
        let mut endpoints: Vec<EndpointDescriptor> = Vec::new();

        for (i, block) in blocks.iter().enumerate() {
            let parsed = match block {
                DescriptorBlock::End => break,
                DescriptorBlock::Raw(raw) => parse_raw(raw).map_err(|e| invalid(format!("block {}: {}", i, e)))?,
                other => other.clone(),
            };

            if i == 0 && !matches!(parsed, DescriptorBlock::Config(_)) {
                return Err(invalid("first descriptor must be the configuration".into()));
            }

            match (&parsed, block) {
                (DescriptorBlock::Config(c), _) => {
                    if config.is_some() {
                        return Err(invalid("more than one configuration descriptor".into()));
                    }
                    if c.configuration_value == 0 {
                        return Err(invalid("configuration value 0 is reserved".into()));
                    }
                    strings.require(c.configuration, label)?;
                    config = Some(*c);
                    c.encode(&mut bytes);
                }
                (DescriptorBlock::Interface(intf), _) => {
                    if let Some(open) = current.take() {
                        open.finish(label)?;
                    }
                    strings.require(intf.interface, label)?;
                    interface_numbers.insert(intf.interface_number);
                    current = Some(OpenInterface {
                        number: intf.interface_number,
                        alternate: intf.alternate_setting,
                        declared: intf.num_endpoints,
                        seen: 0,
                    });
                    intf.encode(&mut bytes);
                }
                (DescriptorBlock::Endpoint(ep), original) => {
                    let Some(open) = current.as_mut() else {
                        return Err(invalid(format!(
                            "endpoint {:#04x} precedes any interface",
                            ep.address
                        )));
                    };
                    if ep.number() == 0 {
                        return Err(invalid("endpoint 0 cannot be declared".into()));
                    }
                    let size = ep.max_packet_size & 0x07ff;
                    if size == 0 || size > 1024 {
                        return Err(invalid(format!(
                            "endpoint {:#04x} has invalid max packet size {}",
                            ep.address, ep.max_packet_size
                        )));
                    }
                    // endpoints are addressed by number alone once enabled
                    if let Some(other) = endpoints
                        .iter()
                        .find(|e| e.number() == ep.number() && e.address != ep.address)
                    {
                        return Err(invalid(format!(
                            "endpoint number {} used by both {:#04x} and {:#04x}",
                            ep.number(),
                            other.address,
                            ep.address
                        )));
                    }
                    open.seen += 1;
                    if !endpoints.iter().any(|e| e.address == ep.address) {
                        endpoints.push(*ep);
                    }
                    match original {
                        // keep audio extension bytes verbatim
                        DescriptorBlock::Raw(raw) => bytes.extend_from_slice(raw),
                        _ => bytes.extend_from_slice(&ep.encode()),
                    }
                }
                (DescriptorBlock::Raw(raw), _) => bytes.extend_from_slice(raw),
                (DescriptorBlock::End, _) => unreachable!("terminator handled above"),
            }
        }

        if let Some(open) = current.take() {
            open.finish(label)?;
        }

        let Some(config) = config else {
            return Err(invalid("no configuration descriptor".into()));
        };
        if usize::from(config.num_interfaces) != interface_numbers.len() {
            return Err(invalid(format!(
                "configuration declares {} interfaces but {} are present",
                config.num_interfaces,
                interface_numbers.len()
            )));
        }
        let total = u16::try_from(bytes.len())
            .map_err(|_| invalid(format!("configuration set is {} bytes long", bytes.len())))?;
        LittleEndian::write_u16(&mut bytes[2..4], total);

        Ok(Self {
            config,
            endpoints,
            bytes,
        })
    }
}

/// Decode a pre-built descriptor, checking its header
fn parse_raw(raw: &[u8]) -> std::result::Result<DescriptorBlock, String> {
    if raw.len() < 2 {
        return Err(format!("{} bytes is too short for a descriptor", raw.len()));
    }
    let declared = usize::from(raw[0]);
    if declared != raw.len() {
        return Err(format!(
            "bLength is {} but the block holds {} bytes",
            declared,
            raw.len()
        ));
    }
    let fixed = |expected: &[usize]| {
        if expected.contains(&raw.len()) {
            Ok(())
        } else {
            Err(format!(
                "descriptor type {:#04x} must be {:?} bytes, got {}",
                raw[1],
                expected,
                raw.len()
            ))
        }
    };
    match raw[1] {
        DT_DEVICE => Err("device descriptor inside a configuration set".into()),
        DT_CONFIG => fixed(&[DT_CONFIG_SIZE]).map(|_| DescriptorBlock::Config(ConfigDescriptor::parse(raw))),
        DT_INTERFACE => fixed(&[DT_INTERFACE_SIZE])
            .map(|_| DescriptorBlock::Interface(InterfaceDescriptor::parse(raw))),
        DT_ENDPOINT => fixed(&[DT_ENDPOINT_SIZE, DT_ENDPOINT_AUDIO_SIZE])
            .map(|_| DescriptorBlock::Endpoint(EndpointDescriptor::parse(raw))),
        _ => Ok(DescriptorBlock::Raw(raw.to_vec())),
    }
}

/// Encoded string descriptors, keyed by index
#[derive(Debug, Clone)]
pub struct StringTable {
    language: u16,
    descriptors: BTreeMap<u8, Vec<u8>>,
}

impl StringTable {
    fn build(strings: &Strings) -> Result<Self> {
        let mut descriptors = BTreeMap::new();
        for entry in &strings.entries {
            if entry.id == 0 {
                return Err(GadgetError::Validation(
                    "string index 0 is reserved for the language table".into(),
                ));
            }
            let units: Vec<u16> = entry.text.encode_utf16().collect();
            if units.len() > MAX_STRING_UNITS {
                return Err(GadgetError::Validation(format!(
                    "string {} is {} UTF-16 units long (max {})",
                    entry.id,
                    units.len(),
                    MAX_STRING_UNITS
                )));
            }
            let mut desc = vec![0u8; 2 + units.len() * 2];
            desc[0] = desc.len() as u8;
            desc[1] = DT_STRING;
            LittleEndian::write_u16_into(&units, &mut desc[2..]);
            if descriptors.insert(entry.id, desc).is_some() {
                return Err(GadgetError::Validation(format!(
                    "string index {} defined twice",
                    entry.id
                )));
            }
        }
        Ok(Self {
            language: strings.language,
            descriptors,
        })
    }

    fn require(&self, index: u8, owner: &str) -> Result<()> {
        if index != 0 && !self.descriptors.contains_key(&index) {
            return Err(GadgetError::Validation(format!(
                "{} references undefined string {}",
                owner, index
            )));
        }
        Ok(())
    }

    pub fn language(&self) -> u16 {
        self.language
    }

    /// String descriptor for GET_DESCRIPTOR(STRING, index, language)
    ///
    /// Index 0 is the language list and ignores `language`.
    pub fn lookup(&self, index: u8, language: u16) -> Option<Vec<u8>> {
        if index == 0 {
            let mut desc = vec![4, DT_STRING, 0, 0];
            LittleEndian::write_u16(&mut desc[2..4], self.language);
            return Some(desc);
        }
        if language != self.language {
            return None;
        }
        self.descriptors.get(&index).cloned()
    }
}

/// Per-speed descriptors of one data endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    pub full_speed: EndpointDescriptor,
    pub high_speed: Option<EndpointDescriptor>,
}

impl EndpointConfig {
    pub fn number(&self) -> u8 {
        self.full_speed.number()
    }

    pub fn address(&self) -> u8 {
        self.full_speed.address
    }

    pub fn is_in(&self) -> bool {
        self.full_speed.is_in()
    }

    /// Descriptor in effect at the given bus speed
    pub fn for_speed(&self, speed: Speed) -> &EndpointDescriptor {
        match (speed.is_high_or_faster(), &self.high_speed) {
            (true, Some(hs)) => hs,
            _ => &self.full_speed,
        }
    }

    /// Bytes written to a gadgetfs endpoint file before any I/O
    pub fn gadgetfs_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 2 * DT_ENDPOINT_SIZE);
        buf.extend_from_slice(&GADGETFS_ENDPOINT_TAG.to_ne_bytes());
        buf.extend_from_slice(&self.full_speed.encode());
        if let Some(hs) = &self.high_speed {
            buf.extend_from_slice(&hs.encode());
        }
        buf
    }
}

/// Validated, marshalled form of a [`Device`]
#[derive(Debug, Clone)]
pub struct DescriptorImage {
    pub device: [u8; DT_DEVICE_SIZE],
    pub full_speed: ConfigLayout,
    pub high_speed: Option<ConfigLayout>,
    pub strings: StringTable,
}

impl DescriptorImage {
    /// Value the host selects to activate the configuration
    pub fn configuration_value(&self) -> u8 {
        self.full_speed.config.configuration_value
    }

    /// Data endpoint numbers in descriptor order
    pub fn endpoint_numbers(&self) -> Vec<u8> {
        self.full_speed.endpoints.iter().map(|e| e.number()).collect()
    }

    /// Descriptors of endpoint `number` at both speeds
    pub fn endpoint(&self, number: u8) -> Option<EndpointConfig> {
        let full_speed = *self
            .full_speed
            .endpoints
            .iter()
            .find(|e| e.number() == number)?;
        let high_speed = self.high_speed.as_ref().and_then(|hs| {
            hs.endpoints
                .iter()
                .find(|e| e.address == full_speed.address)
                .copied()
        });
        Some(EndpointConfig {
            full_speed,
            high_speed,
        })
    }

    /// The gadgetfs device registration write:
    /// `tag | full-speed config | high-speed config | device descriptor`
    pub fn gadgetfs_bytes(&self) -> Vec<u8> {
        let hs_len = self.high_speed.as_ref().map_or(0, |hs| hs.bytes.len());
        let mut buf =
            Vec::with_capacity(4 + self.full_speed.bytes.len() + hs_len + DT_DEVICE_SIZE);
        buf.extend_from_slice(&GADGETFS_DEVICE_TAG.to_ne_bytes());
        buf.extend_from_slice(&self.full_speed.bytes);
        if let Some(hs) = &self.high_speed {
            buf.extend_from_slice(&hs.bytes);
        }
        buf.extend_from_slice(&self.device);
        buf
    }
}

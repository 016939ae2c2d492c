//! Loopback device description

use crate::config::DeviceSettings;
use gadget::descriptor::{CLASS_VENDOR_SPEC, CONFIG_ATT_ONE, CONFIG_ATT_SELFPOWER};
use gadget::{
    ConfigDescriptor, DescriptorBlock, Device, DeviceDescriptor, EndpointDescriptor,
    InterfaceDescriptor, Strings,
};

pub const STRING_MANUFACTURER: u8 = 25;
pub const STRING_PRODUCT: u8 = 45;
pub const STRING_SERIAL: u8 = 101;
pub const STRING_LOOPBACK: u8 = 250;

pub const CONFIG_LOOPBACK: u8 = 2;

fn config_set(settings: &DeviceSettings, packet_size: u16) -> Vec<DescriptorBlock> {
    vec![
        DescriptorBlock::Config(ConfigDescriptor {
            num_interfaces: 1,
            configuration_value: CONFIG_LOOPBACK,
            configuration: STRING_LOOPBACK,
            attributes: CONFIG_ATT_ONE | CONFIG_ATT_SELFPOWER,
            max_power: 1, // self-powered
        }),
        DescriptorBlock::Interface(InterfaceDescriptor {
            interface_number: 0,
            alternate_setting: 0,
            num_endpoints: 2,
            interface_class: CLASS_VENDOR_SPEC,
            interface_subclass: 0,
            interface_protocol: 0,
            interface: STRING_LOOPBACK,
        }),
        DescriptorBlock::Endpoint(EndpointDescriptor::bulk_in(settings.in_endpoint, packet_size)),
        DescriptorBlock::Endpoint(EndpointDescriptor::bulk_out(
            settings.out_endpoint,
            packet_size,
        )),
        DescriptorBlock::End,
    ]
}

/// Vendor-specific device with one bulk IN and one bulk OUT endpoint
pub fn loopback_device(settings: &DeviceSettings, vendor_id: u16, product_id: u16) -> Device {
    Device {
        device: DeviceDescriptor {
            device_class: CLASS_VENDOR_SPEC,
            vendor_id,
            product_id,
            manufacturer: STRING_MANUFACTURER,
            product: STRING_PRODUCT,
            serial_number: STRING_SERIAL,
            ..Default::default()
        },
        full_speed: config_set(settings, settings.full_speed_packet),
        high_speed: Some(config_set(settings, settings.high_speed_packet)),
        strings: Strings::new(settings.language)
            .with(STRING_MANUFACTURER, settings.manufacturer.clone())
            .with(STRING_PRODUCT, settings.product.clone())
            .with(STRING_SERIAL, settings.serial.clone())
            .with(STRING_LOOPBACK, "The loopback"),
    }
}

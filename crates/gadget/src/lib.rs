//! User-space USB gadget sessions
//!
//! This crate registers a USB device description with the kernel's gadgetfs
//! subsystem and drives its lifecycle: it turns the control channel's
//! notification stream into typed [`Event`]s, answers standard control
//! requests, tracks which endpoints the host has enabled, and provides
//! blocking, cancellable endpoint I/O with timeouts.
//!
//! The caller owns the readiness loop. Poll [`Session::control_fd`] and call
//! [`Session::handle_control_event`] whenever it is readable; the registered
//! callback runs synchronously on that thread.

pub mod backend;
pub mod descriptor;
pub mod endian;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod interrupt;
pub mod mock;
pub mod session;

pub use backend::{Backend, ControlEndpoint, DEFAULT_GADGETFS_PATH, GadgetFs};
pub use descriptor::{
    ConfigDescriptor, DescriptorBlock, DescriptorImage, Device, DeviceDescriptor,
    EndpointDescriptor, InterfaceDescriptor, StringEntry, Strings,
};
pub use endpoint::{Direction, Endpoint};
pub use error::{GadgetError, Result};
pub use event::{Event, Speed};
pub use session::{ControlStatus, EventCallback, Session};

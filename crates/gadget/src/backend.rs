//! Kernel backend
//!
//! The session talks to the kernel through two seams: a [`Backend`] that
//! registers descriptors and opens data endpoints, and the
//! [`ControlEndpoint`] it returns for endpoint 0.
//!
//! [`GadgetFs`] implements them on top of a mounted gadgetfs directory:
//!
//! - the controller file (named after the UDC, e.g. `musb-hdrc`) is
//!   configured with `tag(0) | fs config | hs config | device` and then
//!   yields 12-byte event records on read
//! - data endpoints are the `ep<N>in*` / `ep<N>out*` files, configured with
//!   `tag(1) | fs endpoint | hs endpoint` before use

use crate::descriptor::{DescriptorImage, EndpointConfig};
use crate::event::SetupPacket;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default gadgetfs mount point
pub const DEFAULT_GADGETFS_PATH: &str = "/dev/gadget";

/// Endpoint 0 of a registered device
pub trait ControlEndpoint: AsFd + Send {
    /// Read one raw notification record into `buf`
    fn read_event(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send the IN data stage of the current request
    fn reply(&mut self, data: &[u8]) -> io::Result<()>;

    /// Complete the status stage of a request without data
    fn ack(&mut self) -> io::Result<()>;

    /// Refuse the current request
    fn stall(&mut self, setup: &SetupPacket) -> io::Result<()>;

    /// Name of the underlying channel
    fn name(&self) -> &str;
}

/// Kernel-side gadget subsystem
pub trait Backend: Send + Sync {
    /// Register the marshalled descriptors and return the control endpoint
    fn open_control(&self, image: &DescriptorImage) -> io::Result<Box<dyn ControlEndpoint>>;

    /// Open and configure a data endpoint; returns the channel and its name
    fn open_endpoint(&self, config: &EndpointConfig) -> io::Result<(File, String)>;

    /// Whether `poll(2)` on an opened endpoint reports real readiness
    ///
    /// When it does not, transfers block inside the kernel call and are
    /// interrupted by signal to honour cancellation and timeouts.
    fn endpoints_pollable(&self) -> bool {
        true
    }
}

/// gadgetfs mounted at a directory
#[derive(Debug, Clone)]
pub struct GadgetFs {
    root: PathBuf,
    controller: Option<String>,
}

impl Default for GadgetFs {
    fn default() -> Self {
        Self::new(DEFAULT_GADGETFS_PATH)
    }
}

impl GadgetFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            controller: None,
        }
    }

    /// Use a specific controller file instead of auto-detecting it
    #[must_use]
    pub fn with_controller(mut self, name: impl Into<String>) -> Self {
        self.controller = Some(name.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Find the controller file: the only entry not named `ep*`
    fn find_controller(&self) -> io::Result<String> {
        if let Some(name) = &self.controller {
            return Ok(name.clone());
        }
        let mut names = list_entries(&self.root)?
            .into_iter()
            .filter(|name| !name.starts_with("ep"));
        match (names.next(), names.next()) {
            (Some(name), None) => Ok(name),
            (None, _) => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no controller file in {}", self.root.display()),
            )),
            (Some(first), Some(second)) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "several controller files in {} ({}, {}, ...); configure one",
                    self.root.display(),
                    first,
                    second
                ),
            )),
        }
    }

    /// Find the file for an endpoint: `ep7in`, `ep7in-bulk`, `ep3out`, ...
    fn find_endpoint(&self, config: &EndpointConfig) -> io::Result<String> {
        let direction = if config.is_in() { "in" } else { "out" };
        let exact = format!("ep{}{}", config.number(), direction);
        let prefix = format!("{}-", exact);
        let mut candidates: Vec<String> = list_entries(&self.root)?
            .into_iter()
            .filter(|name| *name == exact || name.starts_with(&prefix))
            .collect();
        candidates.sort();
        // prefer the plain name when both exist
        candidates.into_iter().next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no gadgetfs file for endpoint {:#04x}", config.address()),
            )
        })
    }
}

fn list_entries(root: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(root)? {
        if let Some(name) = entry?.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Writes one configuration block, failing on a partial write
fn write_config(file: &mut File, bytes: &[u8]) -> io::Result<()> {
    let written = file.write(bytes)?;
    if written != bytes.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("kernel accepted {} of {} configuration bytes", written, bytes.len()),
        ));
    }
    Ok(())
}

impl Backend for GadgetFs {
    fn open_control(&self, image: &DescriptorImage) -> io::Result<Box<dyn ControlEndpoint>> {
        let name = self.find_controller()?;
        let path = self.root.join(&name);
        debug!("Registering descriptors with {}", path.display());

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        write_config(&mut file, &image.gadgetfs_bytes())?;

        Ok(Box::new(GadgetFsControl { file, name }))
    }

    fn open_endpoint(&self, config: &EndpointConfig) -> io::Result<(File, String)> {
        let name = self.find_endpoint(config)?;
        let path = self.root.join(&name);
        debug!("Configuring endpoint {}", path.display());

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        write_config(&mut file, &config.gadgetfs_bytes())?;

        Ok((file, name))
    }

    // endpoint files have no poll method, so poll reports them always ready
    fn endpoints_pollable(&self) -> bool {
        false
    }
}

/// gadgetfs controller file after registration
struct GadgetFsControl {
    file: File,
    name: String,
}

impl AsFd for GadgetFsControl {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl ControlEndpoint for GadgetFsControl {
    fn read_event(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn reply(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)
    }

    fn ack(&mut self) -> io::Result<()> {
        // a zero-length read completes the status stage
        self.file.read(&mut []).map(|_| ())
    }

    fn stall(&mut self, setup: &SetupPacket) -> io::Result<()> {
        // transferring against the request's direction halts ep0
        let result = if setup.is_in() {
            self.file.read(&mut []).map(|_| ())
        } else {
            self.file.write(&[]).map(|_| ())
        };
        match result {
            Err(e) if e.raw_os_error() == Some(nix::libc::EL2HLT) => Ok(()),
            other => other,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

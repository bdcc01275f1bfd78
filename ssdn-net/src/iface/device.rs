//! Kernel TUN/TAP devices driven by the tokio reactor.

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::pin::Pin;

use nix::libc;
use tokio::io::unix::AsyncFd;

pub type DeviceFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// Async frame I/O on a virtual interface.
///
/// A TAP device carries Ethernet frames, a TUN device raw IP packets.
/// `read` returning `Ok(0)` means the device is gone.
pub trait FrameDevice: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> DeviceFuture<'a, usize>;
    fn write<'a>(&'a self, buf: &'a [u8]) -> DeviceFuture<'a, usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Tun,
    Tap,
}

/// Flags from linux/if_tun.h
const IFF_TUN: libc::c_short = 0x0001;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

const TUNSETIFF: libc::Ioctl = 0x400454ca;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

pub struct TunTapDevice {
    name: String,
    fd: AsyncFd<File>,
}

impl TunTapDevice {
    /// Create a device from a name template such as `sl3.tun%d`. The kernel
    /// fills in the index; the resulting name is read back.
    pub fn open(kind: DeviceKind, template: &str) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")?;

        let mode = match kind {
            DeviceKind::Tun => IFF_TUN,
            DeviceKind::Tap => IFF_TAP,
        };
        let mut ifr = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: mode | IFF_NO_PI,
            _pad: [0; 22],
        };

        let template = template.as_bytes();
        if template.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "device name template too long",
            ));
        }
        for (i, &b) in template.iter().enumerate() {
            ifr.ifr_name[i] = b as libc::c_char;
        }

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let name: Vec<u8> = ifr
            .ifr_name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();

        Ok(Self {
            name: String::from_utf8_lossy(&name).into_owned(),
            fd: AsyncFd::new(file)?,
        })
    }

    async fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_frame(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl FrameDevice for TunTapDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn read<'a>(&'a self, buf: &'a mut [u8]) -> DeviceFuture<'a, usize> {
        Box::pin(self.read_frame(buf))
    }

    fn write<'a>(&'a self, buf: &'a [u8]) -> DeviceFuture<'a, usize> {
        Box::pin(self.write_frame(buf))
    }
}

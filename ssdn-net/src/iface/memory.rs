//! In-memory devices and provider for exercising the interface services.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use super::device::{DeviceFuture, FrameDevice};
use super::invoker::InvokeError;
use super::provider::{BridgePort, InterfaceProvider, ProviderFuture};
use super::IfaceError;

pub struct MemoryDevice {
    name: String,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// The far side of a [`MemoryDevice`].
pub struct DeviceEnd {
    pub name: String,
    pub inject: mpsc::UnboundedSender<Vec<u8>>,
    pub written: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub fn memory_device(name: &str) -> (Arc<MemoryDevice>, DeviceEnd) {
    let (inject, inbound) = mpsc::unbounded_channel();
    let (outbound, written) = mpsc::unbounded_channel();
    let device = Arc::new(MemoryDevice {
        name: name.to_string(),
        inbound: tokio::sync::Mutex::new(inbound),
        outbound,
    });
    let end = DeviceEnd {
        name: name.to_string(),
        inject,
        written,
    };
    (device, end)
}

impl FrameDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn read<'a>(&'a self, buf: &'a mut [u8]) -> DeviceFuture<'a, usize> {
        Box::pin(async move {
            let Some(frame) = self.inbound.lock().await.recv().await else {
                return Ok(0);
            };
            let n = frame.len().min(buf.len());
            buf[..n].copy_from_slice(&frame[..n]);
            Ok(n)
        })
    }

    fn write<'a>(&'a self, buf: &'a [u8]) -> DeviceFuture<'a, usize> {
        Box::pin(async move {
            self.outbound
                .send(buf.to_vec())
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
            Ok(buf.len())
        })
    }
}

/// Hands out memory devices and records every action it is asked to run.
#[derive(Default)]
pub struct MemoryProvider {
    created: AtomicUsize,
    fail_attach: AtomicBool,
    calls: Mutex<Vec<String>>,
    ends: Mutex<Vec<DeviceEnd>>,
}

impl MemoryProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make container injection and port attachment fail.
    pub fn set_fail_attach(&self, fail: bool) {
        self.fail_attach.store(fail, Ordering::SeqCst);
    }

    fn check_attach(&self, call: &str) -> Result<(), IfaceError> {
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(IfaceError::Invoke(InvokeError::Spawn {
                command: call.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }));
        }
        Ok(())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Take the far end of the most recently created device.
    pub fn take_end(&self) -> Option<DeviceEnd> {
        self.ends.lock().unwrap_or_else(PoisonError::into_inner).pop()
    }

    fn record(&self, call: String) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    fn create(&self, template: &str) -> Arc<dyn FrameDevice> {
        let index = self.created.fetch_add(1, Ordering::SeqCst);
        let prefix = template.trim_end_matches("%d");
        let (device, end) = memory_device(&format!("{prefix}{index}"));
        self.ends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(end);
        device
    }
}

impl InterfaceProvider for MemoryProvider {
    fn create_tap<'a>(&'a self, template: &'a str) -> ProviderFuture<'a, Arc<dyn FrameDevice>> {
        Box::pin(async move { Ok(self.create(template)) })
    }

    fn create_tun<'a>(&'a self, template: &'a str) -> ProviderFuture<'a, Arc<dyn FrameDevice>> {
        Box::pin(async move { Ok(self.create(template)) })
    }

    fn create_bridge<'a>(&'a self, bridge: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("create {bridge}"));
            Ok(())
        })
    }

    fn link_to_bridge<'a>(&'a self, bridge: &'a str, tap: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("link {bridge} {tap}"));
            Ok(())
        })
    }

    fn inject<'a>(
        &'a self,
        container: &'a str,
        iface: &'a str,
        ip_with_mask: &'a str,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let call = format!("inject {container} {iface} {ip_with_mask}");
            self.check_attach(&call)?;
            self.record(call);
            Ok(())
        })
    }

    fn attach_port<'a>(&'a self, port: &'a BridgePort) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let mut call = format!(
                "attach {} {} {}",
                port.bridge, port.container, port.local_iface
            );
            if let Some(address) = &port.address {
                call.push_str(&format!(" {} {}", address.ip_with_mask, address.mac));
            }
            self.check_attach(&call)?;
            self.record(call);
            Ok(())
        })
    }

    fn detach_port<'a>(&'a self, port: &'a BridgePort) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("detach {} {}", port.bridge, port.local_iface));
            Ok(())
        })
    }

    fn init_host<'a>(
        &'a self,
        iface: &'a str,
        ip_with_mask: &'a str,
        alternate_networks: &'a [String],
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!(
                "init {iface} {ip_with_mask} {}",
                alternate_networks.join(" ")
            ));
            Ok(())
        })
    }
}

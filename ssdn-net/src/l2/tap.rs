use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{Level, debug, trace};

use crate::iface::FrameDevice;
use crate::packet::MAX_PACKET_SIZE;
use crate::peer::protocol::{LinkReader, LinkWriter, Result, frame_header, parse_frame_header};
use crate::reconnect::AbortSignal;
use crate::task::TaskGuard;

/// Pump frames between `device` and a handshaken link until either side
/// closes or `abort` fires. Control frames are dropped.
pub async fn forward_frames(
    device: Arc<dyn FrameDevice>,
    reader: LinkReader,
    mut writer: LinkWriter,
    abort: Option<AbortSignal>,
) -> Result<()> {
    let mut read_task = TaskGuard(tokio::spawn(link_to_device(reader, Arc::clone(&device))));

    let result = tokio::select! {
        result = &mut read_task.0 => result.unwrap_or_else(|e| {
            debug!(error = %e, "Link reader failed");
            Ok(())
        }),
        result = device_to_link(device.as_ref(), &mut writer) => result,
        _ = wait_abort(abort) => Ok(()),
    };
    debug!(device = %device.name(), "Frame forwarding ended");
    result
}

async fn wait_abort(abort: Option<AbortSignal>) {
    match abort {
        Some(mut abort) => {
            let _ = abort.wait_for(|a| *a).await;
        }
        None => std::future::pending().await,
    }
}

async fn link_to_device(mut reader: LinkReader, device: Arc<dyn FrameDevice>) -> Result<()> {
    let tracing = tracing::enabled!(Level::TRACE);
    let mut header = [0u8; 2];
    let mut frame = vec![0u8; MAX_PACKET_SIZE];

    loop {
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let (control, len) = parse_frame_header(header);
        reader.read_exact(&mut frame[..len]).await?;
        if control {
            if tracing {
                trace!("Received control message");
            }
            continue;
        }

        device.write(&frame[..len]).await?;
        if tracing {
            trace!(len, "Wrote frame to tap");
        }
    }
}

async fn device_to_link(device: &dyn FrameDevice, writer: &mut LinkWriter) -> Result<()> {
    let tracing = tracing::enabled!(Level::TRACE);
    let mut frame = vec![0u8; MAX_PACKET_SIZE];

    loop {
        let n = device.read(&mut frame).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&frame_header(n, false)).await?;
        writer.write_all(&frame[..n]).await?;
        writer.flush().await?;
        if tracing {
            trace!(len = n, "Sent frame message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::memory::memory_device;
    use crate::peer::protocol::{PING_FRAME, split_link};
    use crate::transport::BoxedStream;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::sync::watch;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (device, mut end) = memory_device("sf2.tap0");
        let (a, b) = duplex(1 << 16);
        let stream: BoxedStream = Box::new(a);
        let (reader, writer) = split_link(stream);
        let task = tokio::spawn(forward_frames(device, reader, writer, None));

        let remote: BoxedStream = Box::new(b);
        let (mut remote_r, mut remote_w) = split_link(remote);

        // link to tap: frames pass through untouched, pings are dropped
        remote_w.write_all(&PING_FRAME).await.unwrap();
        remote_w.write_all(&frame_header(3, false)).await.unwrap();
        remote_w.write_all(&[0xAA, 0xBB, 0xCC]).await.unwrap();
        remote_w.flush().await.unwrap();
        let written = timeout(Duration::from_secs(5), end.written.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written, vec![0xAA, 0xBB, 0xCC]);

        // tap to link
        end.inject.send(vec![1, 2, 3, 4, 5]).unwrap();
        let mut header = [0u8; 2];
        remote_r.read_exact(&mut header).await.unwrap();
        assert_eq!(parse_frame_header(header), (false, 5));
        let mut payload = [0u8; 5];
        remote_r.read_exact(&mut payload).await.unwrap();
        assert_eq!(payload, [1, 2, 3, 4, 5]);

        drop(remote_w);
        drop(remote_r);
        timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_abort_ends_forwarding() {
        let (device, _end) = memory_device("sf2.tap0");
        let (a, _b) = duplex(1 << 16);
        let stream: BoxedStream = Box::new(a);
        let (reader, writer) = split_link(stream);
        let (abort_tx, abort_rx) = watch::channel(false);
        let task = tokio::spawn(forward_frames(device, reader, writer, Some(abort_rx)));

        abort_tx.send_replace(true);
        timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

//! Long-lived streaming responses: `/live` (SSE) and `/mjpeg`.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use super::write_stream_header;
use crate::control::CoachState;

/// Idle time after which `/live` writes a comment line.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
/// `/mjpeg` re-emits the latest frame at this period.
pub const MJPEG_INTERVAL: Duration = Duration::from_millis(50);

const POLL: Duration = Duration::from_millis(250);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) fn spawn_live(
    mut stream: TcpStream,
    state: Arc<CoachState>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    write_stream_header(&mut stream, "text/event-stream")?;
    let (id, rx) = state.broadcaster().subscribe_channel();
    thread::Builder::new()
        .name(format!("coach-live-{}", id))
        .spawn(move || {
            match pump_live(&mut stream, &rx, &shutdown, KEEPALIVE_INTERVAL) {
                Ok(()) => log::debug!("live client {} finished", id),
                Err(e) => log::debug!("live client {} disconnected: {:#}", id, e),
            }
            state.broadcaster().unsubscribe(id);
        })
        .context("spawn live stream thread")?;
    Ok(())
}

/// Forward every payload from `rx` as an SSE `data:` event until the client
/// goes away, the broadcaster drops us, or shutdown is requested.
pub(super) fn pump_live<W: Write>(
    out: &mut W,
    rx: &Receiver<Arc<str>>,
    shutdown: &AtomicBool,
    keepalive: Duration,
) -> Result<()> {
    let mut last_write = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        match rx.recv_timeout(POLL) {
            Ok(payload) => {
                write!(out, "data: {}\n\n", payload)?;
                out.flush()?;
                last_write = Instant::now();
            }
            Err(RecvTimeoutError::Timeout) => {
                if last_write.elapsed() >= keepalive {
                    out.write_all(b": keepalive\n\n")?;
                    out.flush()?;
                    last_write = Instant::now();
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

pub(super) fn spawn_mjpeg(
    mut stream: TcpStream,
    state: Arc<CoachState>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    write_stream_header(&mut stream, "multipart/x-mixed-replace; boundary=frame")?;
    thread::Builder::new()
        .name("coach-mjpeg".to_string())
        .spawn(move || {
            let mut parts = 0u64;
            while !shutdown.load(Ordering::SeqCst) {
                if let Some(frame) = state.frames().latest() {
                    if let Err(e) = write_part(&mut stream, &frame.jpeg) {
                        log::debug!("mjpeg client disconnected after {} parts: {:#}", parts, e);
                        return;
                    }
                    parts += 1;
                }
                thread::sleep(MJPEG_INTERVAL);
            }
        })
        .context("spawn mjpeg stream thread")?;
    Ok(())
}

pub(super) fn write_part<W: Write>(out: &mut W, jpeg: &[u8]) -> Result<()> {
    write!(
        out,
        "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    )?;
    out.write_all(jpeg)?;
    out.write_all(b"\r\n")?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn live_frames_each_payload_as_an_event() {
        let (tx, rx) = mpsc::channel::<Arc<str>>();
        tx.send(Arc::from(r#"{"n":1}"#)).unwrap();
        tx.send(Arc::from(r#"{"n":2}"#)).unwrap();
        drop(tx);
        let mut out = Vec::new();
        pump_live(&mut out, &rx, &AtomicBool::new(false), KEEPALIVE_INTERVAL).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "data: {\"n\":1}\n\ndata: {\"n\":2}\n\n"
        );
    }

    #[test]
    fn idle_live_stream_sends_keepalive() {
        let (tx, rx) = mpsc::channel::<Arc<str>>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stopper = shutdown.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(700));
            stopper.store(true, Ordering::SeqCst);
            drop(tx);
        });
        let mut out = Vec::new();
        pump_live(&mut out, &rx, &shutdown, Duration::from_millis(100)).unwrap();
        handle.join().unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with(": keepalive\n\n"));
    }

    #[test]
    fn mjpeg_part_layout() {
        let mut out = Vec::new();
        write_part(&mut out, &[0xFF, 0xD8, 0xFF, 0xD9]).unwrap();
        let head = b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n";
        assert_eq!(&out[..head.len()], head);
        assert_eq!(&out[head.len()..], &[0xFF, 0xD8, 0xFF, 0xD9, b'\r', b'\n']);
    }
}

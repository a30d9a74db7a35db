//! Keyboard event capture from /dev/input.
//!
//! Discovery probes every event device for key capability; monitoring polls
//! the surviving descriptors from a single thread and forwards initial key
//! presses to the binding table.

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use evdev::{AttributeSetRef, Device, EventType, InputEvent, InputEventKind, Key};
use itertools::Itertools;
use log::{debug, info, warn};
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, poll};

use crate::bindings::Bindings;

const INPUT_DIR: &str = "/dev/input";
/// Bounded poll timeout so the loop wakes periodically even when idle.
const POLL_TIMEOUT_MS: i32 = 1000;

const SOURCE_GONE: PollFlags = PollFlags::POLLERR
    .union(PollFlags::POLLHUP)
    .union(PollFlags::POLLNVAL);

/// One opened event device being monitored.
struct InputSource {
    name: String,
    path: PathBuf,
    device: Device,
}

/// Merges key events from every capable input device into one stream.
pub struct InputMultiplexer {
    sources: Vec<InputSource>,
}

/// Extracts the key from an initial press. Repeats, releases and non-key
/// events are discarded at the point of receipt.
pub fn key_press(event: &InputEvent) -> Option<Key> {
    match event.kind() {
        InputEventKind::Key(key) if event.value() == 1 => Some(key),
        _ => None,
    }
}

/// A device qualifies only if its event-type bitmask advertises key events.
fn key_capable(supported: &AttributeSetRef<EventType>) -> bool {
    supported.contains(EventType::KEY)
}

/// Probe pass: open each event device, keep the ones advertising key events.
fn find_key_devices() -> Result<Vec<(PathBuf, String)>> {
    let mut found = Vec::new();
    let entries =
        fs::read_dir(INPUT_DIR).with_context(|| format!("cannot enumerate {INPUT_DIR}"))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with("event") {
            continue;
        }
        let path = entry.path();
        match Device::open(&path) {
            Ok(device) => {
                if key_capable(device.supported_events()) {
                    let name = device.name().unwrap_or("unknown").to_string();
                    info!("found input device: {name} ({})", path.display());
                    found.push((path, name));
                }
            }
            Err(e) => debug!("skipping {}: {e}", path.display()),
        }
    }
    Ok(found)
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).context("F_GETFL failed")?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).context("F_SETFL failed")?;
    Ok(())
}

impl InputMultiplexer {
    /// Discovers key-capable devices and opens each one for monitoring.
    /// Errors when no device could be kept open.
    pub fn open() -> Result<Self> {
        let candidates = find_key_devices()?;
        if candidates.is_empty() {
            bail!("no key-capable devices under {INPUT_DIR}");
        }

        let mut sources = Vec::new();
        for (path, name) in candidates {
            let device = match Device::open(&path) {
                Ok(device) => device,
                Err(e) => {
                    warn!(
                        "cannot open {}: {e}; add your user to the 'input' group or run as root",
                        path.display()
                    );
                    continue;
                }
            };
            if let Err(e) = set_nonblocking(device.as_raw_fd()) {
                warn!("cannot switch {} to non-blocking reads: {e:#}", path.display());
                continue;
            }
            sources.push(InputSource { name, path, device });
        }

        if sources.is_empty() {
            bail!("none of the key-capable devices could be opened");
        }
        info!(
            "monitoring {} input devices: {}",
            sources.len(),
            sources.iter().map(|s| s.name.as_str()).format(", ")
        );
        Ok(Self { sources })
    }

    pub fn sources(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.sources
            .iter()
            .map(|s| (s.name.as_str(), s.path.as_path()))
    }

    /// Runs the dispatch loop until a poll error or every device disappears.
    ///
    /// The poll is the only suspension point; draining and callbacks run
    /// inline on this thread, so a slow callback delays every other source.
    pub fn monitor(&mut self, bindings: &Bindings) -> Result<()> {
        loop {
            let borrowed: Vec<BorrowedFd> = self
                .sources
                .iter()
                .map(|s| unsafe { BorrowedFd::borrow_raw(s.device.as_raw_fd()) })
                .collect();
            let mut poll_fds: Vec<PollFd> = borrowed
                .iter()
                .map(|fd| PollFd::new(fd, PollFlags::POLLIN))
                .collect();
            let ready =
                poll(&mut poll_fds, POLL_TIMEOUT_MS).context("poll on input devices failed")?;
            if ready == 0 {
                continue;
            }
            let revents: Vec<PollFlags> = poll_fds
                .iter()
                .map(|p| p.revents().unwrap_or(PollFlags::empty()))
                .collect();
            drop(poll_fds);

            let mut dead = Vec::new();
            for (idx, source) in self.sources.iter_mut().enumerate() {
                if revents[idx].intersects(SOURCE_GONE) {
                    dead.push(idx);
                    continue;
                }
                if !revents[idx].contains(PollFlags::POLLIN) {
                    continue;
                }
                match source.device.fetch_events() {
                    Ok(events) => {
                        for event in events {
                            if let Some(key) = key_press(&event) {
                                bindings.dispatch(key);
                            }
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        warn!("read error on {}: {e}", source.name);
                        dead.push(idx);
                    }
                }
            }
            for idx in dead.into_iter().rev() {
                let source = self.sources.remove(idx);
                info!("dropping input device {} ({})", source.name, source.path.display());
            }
            if self.sources.is_empty() {
                bail!("all input devices disappeared");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_only_the_initial_press() {
        let code = Key::KEY_BRIGHTNESSUP.code();
        let stream = [
            InputEvent::new(EventType::KEY, code, 1),
            InputEvent::new(EventType::KEY, code, 2),
            InputEvent::new(EventType::KEY, code, 2),
            InputEvent::new(EventType::KEY, code, 0),
        ];
        let presses: Vec<Key> = stream.iter().filter_map(key_press).collect();
        assert_eq!(presses, vec![Key::KEY_BRIGHTNESSUP]);
    }

    #[test]
    fn ignores_pointer_events() {
        let motion = InputEvent::new(EventType::RELATIVE, 0, 5);
        assert_eq!(key_press(&motion), None);
    }

    #[test]
    fn pointer_only_devices_are_not_capable() {
        let mut pointer = AttributeSet::new();
        pointer.insert(EventType::RELATIVE);
        assert!(!key_capable(&pointer));

        let mut keyboard = AttributeSet::new();
        keyboard.insert(EventType::KEY);
        keyboard.insert(EventType::REPEAT);
        assert!(key_capable(&keyboard));
    }
}

// Copyright (C) 2020  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Hardware abstraction for the daisy-chained SHA256 search accelerators.
//!
//! The chain is addressed in two modes: a broadcast "shared" bus where one
//! payload is latched identically by every device, and a "daisy" bus which
//! is one long shift register threaded through all devices (MSB first of
//! the composite payload). Job payloads go over the shared bus, per-device
//! configuration and result readback over the daisy bus.

#[cfg(feature = "spi_chain")]
pub mod spichain;

use crate::error::{self, ErrorKind};
use crate::misc::LOGGER;

use packed_struct::prelude::*;
use packed_struct_codegen::PackedStruct;

use slog::warn;

use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Size of the SHA256 midstate part of the job payload
pub const MIDSTATE_SIZE: usize = 32;

/// Size of the header tail part of the job payload
pub const TAIL_SIZE: usize = 16;

/// One shared-bus job transfer: midstate followed by the header tail
pub const JOB_PAYLOAD_SIZE: usize = MIDSTATE_SIZE + TAIL_SIZE;

/// Each device shifts out one result record on the daisy bus
pub const RESULT_RECORD_SIZE: usize = 5;

/// The device offset is a single byte, so at most 256 devices can split the
/// high nonce byte between them
pub const MAX_DEVICES: usize = 256;

/// The core identifier is reported as a one-hot byte which caps the number
/// of search cores per device
pub const MAX_CORES_PER_DEVICE: usize = 8;

/// Nonce region of the header tail. The devices substitute their own nonce
/// candidates here; the firmware expects the region zeroed on load.
pub const TAIL_NONCE_RESERVED: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

/// How long the readiness poller sleeps between samples. Each sample takes
/// the bus lock, so the gap is what lets an interrupt pulse from the network
/// side interleave with a poll in progress.
const POLL_PERIOD: Duration = Duration::from_micros(100);

/// Transport contract of the accelerator bus.
///
/// Implementations provide raw framed access only; pairing of selects and
/// deselects on every exit path is enforced by the controller through scoped
/// guards. All framed transfers are MSB-first byte streams with no implicit
/// byte reversal.
pub trait Bus: Send + 'static {
    /// Hold all devices in reset. Internal search halts and device state is
    /// undefined for reads while asserted.
    fn assert_reset(&mut self) -> error::Result<()>;
    /// Release the reset line; devices resume searching from their
    /// configured offset.
    fn deassert_reset(&mut self) -> error::Result<()>;

    /// Begin a broadcast transaction seen identically by all devices
    fn select_shared(&mut self) -> error::Result<()>;
    fn deselect_shared(&mut self) -> error::Result<()>;
    fn write_shared(&mut self, data: &[u8]) -> error::Result<()>;

    /// Begin a shift-register transaction through the whole chain
    fn select_daisy(&mut self) -> error::Result<()>;
    fn deselect_daisy(&mut self) -> error::Result<()>;
    fn write_daisy(&mut self, data: &[u8]) -> error::Result<()>;
    fn read_daisy(&mut self, len: usize) -> error::Result<Vec<u8>>;

    /// Non-blocking sample of the wired-OR "result available" line
    fn poll_ready(&mut self) -> error::Result<bool>;
}

/// Scoped daisy-bus transaction. The selection is released when the guard is
/// consumed by [`DaisyGuard::release`] or, on error paths, when it drops.
struct DaisyGuard<'a, B: Bus> {
    bus: &'a mut B,
    armed: bool,
}

impl<'a, B: Bus> DaisyGuard<'a, B> {
    fn select(bus: &'a mut B) -> error::Result<Self> {
        bus.select_daisy()?;
        Ok(Self { bus, armed: true })
    }

    fn release(mut self) -> error::Result<()> {
        self.armed = false;
        self.bus.deselect_daisy()
    }
}

impl<'a, B: Bus> Drop for DaisyGuard<'a, B> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.bus.deselect_daisy() {
                warn!(LOGGER, "daisy bus deselect failed while unwinding: {}", e);
            }
        }
    }
}

/// Scoped shared-bus transaction, see [`DaisyGuard`]
struct SharedGuard<'a, B: Bus> {
    bus: &'a mut B,
    armed: bool,
}

impl<'a, B: Bus> SharedGuard<'a, B> {
    fn select(bus: &'a mut B) -> error::Result<Self> {
        bus.select_shared()?;
        Ok(Self { bus, armed: true })
    }

    fn release(mut self) -> error::Result<()> {
        self.armed = false;
        self.bus.deselect_shared()
    }
}

impl<'a, B: Bus> Drop for SharedGuard<'a, B> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.bus.deselect_shared() {
                warn!(LOGGER, "shared bus deselect failed while unwinding: {}", e);
            }
        }
    }
}

/// Result record shifted out by each device: a one-hot core flag byte
/// (0 means no hit) followed by the raw 32-bit nonce, big endian.
#[derive(PackedStruct, Debug, PartialEq)]
#[packed_struct(endian = "msb")]
pub struct ResultRecord {
    pub flags: u8,
    pub nonce: u32,
}

/// Controller states over the device array
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Reset line asserted, devices halted and configurable
    Reset,
    /// Reset line released, devices are searching
    Running,
    /// The ready line fired, results can be read back
    Ready,
}

struct Inner<B: Bus> {
    bus: B,
    state: State,
}

/// Driver for the accelerator array.
///
/// All bus traffic is funneled through one internal lock; the only operation
/// intended to be called concurrently with a poll in progress is
/// [`ChainCtl::interrupt_execution`] which merely pulses the daisy select
/// line.
pub struct ChainCtl<B: Bus> {
    inner: Mutex<Inner<B>>,
    /// Per-device high nonce byte offsets, loaded once over the daisy bus
    device_configs: Vec<u8>,
    /// Number of bits the devices use internally to address their cores
    hardcoded_bits: u32,
}

impl<B: Bus> ChainCtl<B> {
    pub fn new(bus: B, number_of_devices: usize, cores_per_device: usize) -> error::Result<Self> {
        if number_of_devices == 0 || number_of_devices > MAX_DEVICES {
            Err(ErrorKind::Chain(format!(
                "number of devices {} out of range 1..={}",
                number_of_devices, MAX_DEVICES
            )))?
        }
        if cores_per_device == 0
            || !cores_per_device.is_power_of_two()
            || cores_per_device > MAX_CORES_PER_DEVICE
        {
            Err(ErrorKind::Chain(format!(
                "cores per device {} must be a power of two between 1 and {}",
                cores_per_device, MAX_CORES_PER_DEVICE
            )))?
        }

        Ok(Self {
            inner: Mutex::new(Inner {
                bus,
                state: State::Reset,
            }),
            device_configs: device_configs(number_of_devices),
            hardcoded_bits: hardcoded_bits(cores_per_device),
        })
    }

    fn lock(&self) -> MutexGuard<Inner<B>> {
        self.inner.lock().expect("bus lock poisoned")
    }

    #[inline]
    pub fn number_of_devices(&self) -> usize {
        self.device_configs.len()
    }

    #[inline]
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Load the per-device offset vector through the daisy bus. The chain is
    /// held in reset for the transfer; the configuration survives searches
    /// and interrupt pulses, so this runs once at startup.
    pub fn update_device_configs(&self) -> error::Result<()> {
        let mut inner = self.lock();
        inner.bus.assert_reset()?;
        inner.state = State::Reset;

        let mut guard = DaisyGuard::select(&mut inner.bus)?;
        guard.bus.write_daisy(&self.device_configs)?;
        guard.release()
    }

    /// Broadcast a job payload (midstate followed by the header tail) to all
    /// devices. The chain is forced into reset first.
    pub fn update_job(
        &self,
        midstate: &[u8; MIDSTATE_SIZE],
        tail: &[u8; TAIL_SIZE],
    ) -> error::Result<()> {
        let mut inner = self.lock();
        inner.bus.assert_reset()?;
        inner.state = State::Reset;

        let payload = pack_job(midstate, tail);
        let mut guard = SharedGuard::select(&mut inner.bus)?;
        guard.bus.write_shared(&payload)?;
        guard.release()
    }

    /// Release the reset line and let the devices search
    pub fn start_execution(&self) -> error::Result<()> {
        let mut inner = self.lock();
        inner.bus.deassert_reset()?;
        inner.state = State::Running;
        Ok(())
    }

    /// Abort an in-progress search without touching device configuration.
    /// The pulse is a select/deselect pair with no payload; an interrupted
    /// device transitions to ready with no hit, so a pending poll returns in
    /// bounded time.
    pub fn interrupt_execution(&self) -> error::Result<()> {
        let mut inner = self.lock();
        let guard = DaisyGuard::select(&mut inner.bus)?;
        guard.release()
    }

    /// Busy-loop the ready line until it fires or `timeout` elapses;
    /// `None` waits indefinitely. This call blocks the current thread and is
    /// meant to run on the blocking worker pool. The bus lock is taken per
    /// sample only, so interrupt pulses can interleave.
    pub fn poll_until_ready_or_timeout(&self, timeout: Option<Duration>) -> error::Result<bool> {
        let start = Instant::now();
        loop {
            {
                let mut inner = self.lock();
                if inner.bus.poll_ready()? {
                    inner.state = State::Ready;
                    return Ok(true);
                }
            }
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return Ok(false);
                }
            }
            thread::sleep(POLL_PERIOD);
        }
    }

    /// Read the result records of all devices and decode the first hit.
    /// Returns the corrected header nonce, or `None` when no device flagged
    /// a result (which is the expected outcome after an interrupt pulse).
    pub fn get_result(&self) -> error::Result<Option<u32>> {
        let raw = {
            let mut inner = self.lock();
            let mut guard = DaisyGuard::select(&mut inner.bus)?;
            let raw = guard.bus.read_daisy(RESULT_RECORD_SIZE * self.device_configs.len())?;
            guard.release()?;
            raw
        };
        self.scan_results(&raw)
    }

    /// Unconditionally return the chain to reset
    pub fn reset(&self) -> error::Result<()> {
        let mut inner = self.lock();
        inner.bus.assert_reset()?;
        inner.state = State::Reset;
        Ok(())
    }

    fn scan_results(&self, raw: &[u8]) -> error::Result<Option<u32>> {
        let mut found = None;
        for (device_index, record) in raw.chunks(RESULT_RECORD_SIZE).enumerate() {
            let record = ResultRecord::unpack_from_slice(record).map_err(|e| {
                ErrorKind::Chain(format!("result record unpacking error: {:?}", e))
            })?;
            if record.flags == 0 {
                continue;
            }
            if record.flags.count_ones() != 1 {
                warn!(
                    LOGGER,
                    "device {} reports malformed core flags {:#04x}, \
                     taking the lowest core",
                    device_index,
                    record.flags
                );
            }
            if found.is_none() {
                found = Some(correct_nonce(
                    record.nonce,
                    record.flags,
                    self.device_configs[device_index],
                    self.hardcoded_bits,
                ));
            } else {
                // at most one device should signal per poll
                warn!(
                    LOGGER,
                    "device {} also signals a hit, keeping the lowest indexed device",
                    device_index
                );
            }
        }
        Ok(found)
    }
}

impl<B: Bus> Drop for ChainCtl<B> {
    /// The devices must be left in reset when the controller goes away
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.get_mut() {
            inner.state = State::Reset;
            if let Err(e) = inner.bus.assert_reset() {
                warn!(LOGGER, "cannot leave devices in reset: {}", e);
            }
        }
    }
}

/// Build the per-device offset vector: device `i` of `n` searches the
/// contiguous 1/n slice of the high nonce byte starting at `i * (256 / n)`.
pub fn device_configs(number_of_devices: usize) -> Vec<u8> {
    let nonce_step = 0x100 / number_of_devices;
    (0..number_of_devices)
        .map(|i| (i * nonce_step) as u8)
        .collect()
}

/// Number of bits a device uses to spread its slice across its cores
pub fn hardcoded_bits(cores_per_device: usize) -> u32 {
    cores_per_device.trailing_zeros()
}

/// Serialize a job into the 48-byte shared-bus frame
pub fn pack_job(
    midstate: &[u8; MIDSTATE_SIZE],
    tail: &[u8; TAIL_SIZE],
) -> [u8; JOB_PAYLOAD_SIZE] {
    let mut payload = [0u8; JOB_PAYLOAD_SIZE];
    payload[..MIDSTATE_SIZE].copy_from_slice(midstate);
    payload[MIDSTATE_SIZE..].copy_from_slice(tail);
    payload
}

/// Reconstruct the true header nonce from a raw device result.
///
/// The devices report the nonce as seen by the individual search core; the
/// core identity and the device offset have to be folded back into the top
/// bits and the counter has to be rewound by the 2 pipeline stages the
/// result lags behind. All arithmetic is wrapping 32-bit, shifts are
/// modulo 32 - this reconstruction must match the device partitioning
/// bit-exactly.
pub fn correct_nonce(raw_nonce: u32, flags: u8, device_offset: u8, hardcoded_bits: u32) -> u32 {
    let core_index = (flags as u32).trailing_zeros();

    let nonce = raw_nonce.wrapping_sub(2);
    let nonce = nonce | core_index.wrapping_shl(32 - hardcoded_bits);
    nonce ^ (device_offset as u32).wrapping_shl(32 - hardcoded_bits - 8)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::MockBus;

    #[test]
    fn test_device_configs() {
        assert_eq!(device_configs(1), vec![0x00]);
        assert_eq!(device_configs(3), vec![0x00, 0x55, 0xaa]);
        assert_eq!(device_configs(4), vec![0x00, 0x40, 0x80, 0xc0]);
        for n in 1..=256 {
            let configs = device_configs(n);
            assert_eq!(configs.len(), n);
            for (i, offset) in configs.iter().enumerate() {
                assert_eq!(*offset as usize, i * (256 / n));
            }
        }
    }

    #[test]
    fn test_hardcoded_bits() {
        assert_eq!(hardcoded_bits(1), 0);
        assert_eq!(hardcoded_bits(2), 1);
        assert_eq!(hardcoded_bits(4), 2);
        assert_eq!(hardcoded_bits(8), 3);
    }

    #[test]
    fn test_correct_nonce() {
        // core 2 of 8 on the device covering 0x40..0x80
        let nonce = correct_nonce(0x0000_0005, 0x04, 0x40, 3);
        assert_eq!(nonce, 0x4800_0003);

        // single core, single device leaves only the pipeline correction
        assert_eq!(correct_nonce(0x0000_0005, 0x01, 0x00, 0), 0x0000_0003);

        // wrap-around in the 32-bit ring
        assert_eq!(correct_nonce(0x0000_0001, 0x01, 0x00, 0), 0xffff_ffff);
    }

    #[test]
    fn test_correct_nonce_deterministic() {
        for flags in [0x01u8, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80].iter() {
            let first = correct_nonce(0xdead_beef, *flags, 0x80, 3);
            let second = correct_nonce(0xdead_beef, *flags, 0x80, 3);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_result_record_layout() {
        let record = ResultRecord {
            flags: 0x04,
            nonce: 0x1234_5678,
        };
        assert_eq!(record.pack(), [0x04u8, 0x12, 0x34, 0x56, 0x78]);

        let parsed = ResultRecord::unpack_from_slice(&[0x01, 0xde, 0xad, 0xbe, 0xef])
            .expect("record unpacking failed");
        assert_eq!(parsed.flags, 0x01);
        assert_eq!(parsed.nonce, 0xdead_beef);
    }

    #[test]
    fn test_update_job_payload() {
        let bus = MockBus::new();
        let ctl = ChainCtl::new(bus.clone(), 4, 8).expect("controller build failed");

        let midstate = [0xabu8; MIDSTATE_SIZE];
        let tail = [0xcdu8; TAIL_SIZE];
        ctl.update_job(&midstate, &tail).expect("job update failed");

        let state = bus.state();
        assert!(state.reset_asserted);
        assert_eq!(state.shared_writes.len(), 1);
        let payload = &state.shared_writes[0];
        assert_eq!(payload.len(), JOB_PAYLOAD_SIZE);
        assert_eq!(payload[..MIDSTATE_SIZE], midstate[..]);
        assert_eq!(payload[MIDSTATE_SIZE..], tail[..]);
        // selections must be balanced after the call
        assert!(!state.shared_selected);
        assert!(!state.daisy_selected);
    }

    #[test]
    fn test_update_device_configs_transfer() {
        let bus = MockBus::new();
        let ctl = ChainCtl::new(bus.clone(), 4, 8).expect("controller build failed");
        ctl.update_device_configs().expect("config update failed");

        let state = bus.state();
        assert!(state.reset_asserted);
        assert_eq!(state.daisy_writes, vec![vec![0x00, 0x40, 0x80, 0xc0]]);
        assert!(!state.daisy_selected);
    }

    #[test]
    fn test_interrupt_is_a_pulse() {
        let bus = MockBus::new();
        let ctl = ChainCtl::new(bus.clone(), 2, 2).expect("controller build failed");
        ctl.interrupt_execution().expect("interrupt failed");

        let state = bus.state();
        assert_eq!(state.daisy_pulses, 1);
        assert!(state.daisy_writes.is_empty());
        assert!(!state.daisy_selected);
    }

    #[test]
    fn test_get_result_first_device_wins() {
        let bus = MockBus::new();
        let ctl = ChainCtl::new(bus.clone(), 4, 8).expect("controller build failed");

        // devices 1 and 3 both claim a hit, device 1 must win
        let mut readback = vec![0u8; 4 * RESULT_RECORD_SIZE];
        readback[5..10].copy_from_slice(&[0x04, 0x00, 0x00, 0x00, 0x05]);
        readback[15..20].copy_from_slice(&[0x01, 0xff, 0xff, 0xff, 0xff]);
        bus.push_daisy_read(readback);

        let nonce = ctl.get_result().expect("result read failed");
        assert_eq!(nonce, Some(correct_nonce(0x0000_0005, 0x04, 0x40, 3)));
        assert!(!bus.state().daisy_selected);
    }

    #[test]
    fn test_get_result_no_hit() {
        let bus = MockBus::new();
        let ctl = ChainCtl::new(bus.clone(), 3, 4).expect("controller build failed");
        bus.push_daisy_read(vec![0u8; 3 * RESULT_RECORD_SIZE]);
        assert_eq!(ctl.get_result().expect("result read failed"), None);
    }

    #[test]
    fn test_bus_released_on_error_path() {
        let bus = MockBus::new();
        let ctl = ChainCtl::new(bus.clone(), 2, 2).expect("controller build failed");

        bus.fail_next_daisy_read();
        assert!(ctl.get_result().is_err());
        // the guard must have deselected the bus while unwinding
        assert!(!bus.state().daisy_selected);
    }

    #[test]
    fn test_poll_timeout() {
        let bus = MockBus::new();
        let ctl = ChainCtl::new(bus.clone(), 1, 1).expect("controller build failed");
        ctl.start_execution().expect("start failed");

        let ready = ctl
            .poll_until_ready_or_timeout(Some(Duration::from_millis(5)))
            .expect("poll failed");
        assert!(!ready);
        assert_eq!(ctl.state(), State::Running);
    }

    #[test]
    fn test_poll_ready_transitions() {
        let bus = MockBus::new();
        let ctl = ChainCtl::new(bus.clone(), 1, 1).expect("controller build failed");
        ctl.start_execution().expect("start failed");

        bus.script_ready(&[false, false, true]);
        let ready = ctl.poll_until_ready_or_timeout(None).expect("poll failed");
        assert!(ready);
        assert_eq!(ctl.state(), State::Ready);
    }

    #[test]
    fn test_drop_leaves_devices_in_reset() {
        let bus = MockBus::new();
        {
            let ctl = ChainCtl::new(bus.clone(), 1, 1).expect("controller build failed");
            ctl.start_execution().expect("start failed");
            assert!(!bus.state().reset_asserted);
        }
        assert!(bus.state().reset_asserted);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert!(ChainCtl::new(MockBus::new(), 0, 1).is_err());
        assert!(ChainCtl::new(MockBus::new(), 257, 1).is_err());
        assert!(ChainCtl::new(MockBus::new(), 1, 3).is_err());
        assert!(ChainCtl::new(MockBus::new(), 1, 16).is_err());
    }
}

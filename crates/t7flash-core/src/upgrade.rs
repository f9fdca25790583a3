//! The upgrade pipeline
//!
//! Straight-line sequencing of a firmware install: compatibility checks,
//! region erases and erase verification, image and header programming,
//! write verification, the upgrade reboot, re-enumeration, and the final
//! version confirmation. Any stage failure aborts the run with the
//! original error.
//!
//! Between the start of [`write_image`] and a successful [`verify_image`]
//! the device has no bootable firmware. Its bootloader survives that state
//! and accepts another attempt; a restarted run begins again at the
//! compatibility checks and re-erases (erasure is idempotent).

use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::flash;
use crate::image::{FirmwareImage, FirmwareVersion};
use crate::link::{DeviceLink, Enumerator};
use crate::t7::{self, regs, FlashRegion};

/// Words transferred between two progress callbacks. A multiple of the
/// region block size, so striping does not change the transaction layout.
const PROGRESS_STRIPE_BLOCKS: usize = 32;

/// Tunables for the rediscovery phase.
#[derive(Debug, Clone)]
pub struct UpgradeConfig {
    /// Pause between the reboot request and the first enumeration scan,
    /// and between unsuccessful scans.
    pub enumeration_grace: Duration,
    /// Give up on rediscovery after this long. `None` waits forever and
    /// relies on the operator to abort.
    pub enumeration_timeout: Option<Duration>,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            enumeration_grace: Duration::from_secs(5),
            enumeration_timeout: Some(Duration::from_secs(300)),
        }
    }
}

/// Result of a completed upgrade.
#[derive(Debug, Clone, Copy)]
pub struct UpgradeOutcome {
    /// Serial number of the upgraded device.
    pub serial: u32,
    /// Firmware version the device now runs.
    pub version: FirmwareVersion,
}

/// Callbacks for reporting pipeline progress.
///
/// All methods have empty defaults; implement only what the frontend
/// displays.
pub trait UpgradeProgress {
    /// A region erase is starting.
    fn erasing(&mut self, _region: &'static str, _pages: u32) {}
    /// The erased regions are being read back, `_total_words` in all.
    fn checking_erase(&mut self, _total_words: usize) {}
    /// A region write is starting.
    fn writing(&mut self, _region: &'static str, _total_words: usize) {}
    /// `_words_done` words of the current write have been acknowledged.
    fn write_progress(&mut self, _words_done: usize) {}
    /// The image region is being read back for verification.
    fn verifying(&mut self, _total_words: usize) {}
    /// `_words_done` words have been verified.
    fn verify_progress(&mut self, _words_done: usize) {}
    /// The reboot request is about to be sent.
    fn rebooting(&mut self) {}
    /// An enumeration scan is about to run.
    fn waiting(&mut self, _attempt: u32) {}
    /// The pipeline finished.
    fn complete(&mut self, _outcome: &UpgradeOutcome) {}
}

/// Progress sink that discards everything.
pub struct NoProgress;

impl UpgradeProgress for NoProgress {}

fn write_failed(region: &FlashRegion, source: Error) -> Error {
    Error::WriteFailed {
        region: region.name,
        source: Box::new(source),
    }
}

/// Program the image payload into the image region.
pub fn write_image<L, P>(link: &mut L, image: &FirmwareImage, progress: &mut P) -> Result<()>
where
    L: DeviceLink + ?Sized,
    P: UpgradeProgress + ?Sized,
{
    let region = &t7::IMAGE_REGION;
    let words = image.image_as_words();
    progress.writing(region.name, words.len());

    let stripe = region.block_words * PROGRESS_STRIPE_BLOCKS;
    let mut done = 0usize;
    while done < words.len() {
        let count = stripe.min(words.len() - done);
        flash::write_flash(
            link,
            region.key,
            region.base + (done as u32) * 4,
            &words[done..done + count],
            region.block_words,
        )
        .map_err(|e| write_failed(region, e))?;
        done += count;
        progress.write_progress(done);
    }
    log::info!("image programmed: {} words", words.len());
    Ok(())
}

/// Program the 128-byte descriptor into the header region.
///
/// Runs after the image write: the header is what makes the image count as
/// present, so it goes in last.
pub fn write_header<L, P>(link: &mut L, image: &FirmwareImage, progress: &mut P) -> Result<()>
where
    L: DeviceLink + ?Sized,
    P: UpgradeProgress + ?Sized,
{
    let region = &t7::HEADER_REGION;
    let words = image.header_as_words();
    progress.writing(region.name, words.len());
    flash::write_flash(link, region.key, region.base, &words, region.block_words)
        .map_err(|e| write_failed(region, e))?;
    log::info!("header programmed");
    Ok(())
}

/// Read the image region back and compare word-for-word with the payload.
pub fn verify_image<L, P>(link: &mut L, image: &FirmwareImage, progress: &mut P) -> Result<()>
where
    L: DeviceLink + ?Sized,
    P: UpgradeProgress + ?Sized,
{
    let region = &t7::IMAGE_REGION;
    let expected = image.image_as_words();
    progress.verifying(expected.len());

    let stripe = region.block_words * PROGRESS_STRIPE_BLOCKS;
    let mut done = 0usize;
    while done < expected.len() {
        let count = stripe.min(expected.len() - done);
        let actual = flash::read_flash(
            link,
            region.base + (done as u32) * 4,
            count,
            region.block_words,
        )?;
        for (i, (&want, &got)) in expected[done..done + count].iter().zip(&actual).enumerate() {
            if want != got {
                return Err(Error::WriteVerifyMismatch {
                    index: done + i,
                    expected: want,
                    actual: got,
                });
            }
        }
        done += count;
        progress.verify_progress(done);
    }
    log::info!("image verified: {} words", expected.len());
    Ok(())
}

/// Send the firmware-upgrade reboot request and close the link.
///
/// The device drops off the bus immediately after acknowledging the
/// request, so the link is closed synchronously here and the caller must
/// rediscover the device to talk to it again.
pub fn request_upgrade_reboot<L: DeviceLink>(mut link: L) -> Result<()> {
    log::info!("requesting firmware upgrade reboot");
    link.write(regs::REQ_FWUPG, t7::REBOOT_KEY)
        .map_err(|e| Error::RebootFailed(Box::new(e)))?;
    link.close().map_err(|e| Error::RebootFailed(Box::new(e)))
}

/// Poll the transport until the device with `serial` reappears, then open
/// and return a fresh link to it.
///
/// Sleeps one grace period before the first scan (the device needs time to
/// leave the bus and boot) and between scans. Scan failures are expected
/// while the device reboots and are only logged.
pub fn wait_for_reenumeration<E, P>(
    enumerator: &mut E,
    serial: u32,
    config: &UpgradeConfig,
    progress: &mut P,
) -> Result<E::Link>
where
    E: Enumerator,
    P: UpgradeProgress + ?Sized,
{
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        thread::sleep(config.enumeration_grace);
        attempt += 1;
        progress.waiting(attempt);

        let visible = match enumerator.list_all() {
            Ok(devices) => devices.iter().any(|d| d.serial == serial),
            Err(e) => {
                log::debug!("enumeration scan failed: {e}");
                false
            }
        };
        if visible {
            match enumerator.open(serial) {
                Ok(link) => {
                    log::info!("device {serial} re-enumerated after {attempt} scan(s)");
                    return Ok(link);
                }
                Err(e) => log::warn!("device {serial} visible but open failed: {e}"),
            }
        }

        if let Some(timeout) = config.enumeration_timeout {
            if started.elapsed() >= timeout {
                return Err(Error::EnumerationTimeout {
                    serial,
                    waited: started.elapsed(),
                });
            }
        }
    }
}

/// Read the running firmware version and require it to match `expected`.
pub fn confirm_version<L: DeviceLink + ?Sized>(
    link: &mut L,
    expected: FirmwareVersion,
) -> Result<()> {
    let actual = FirmwareVersion::from_f32(link.read_f32(regs::FIRMWARE_VERSION)?);
    if actual != expected {
        return Err(Error::VersionMismatch { expected, actual });
    }
    log::info!("device reports firmware {actual}");
    Ok(())
}

/// Run the whole pipeline against an opened device.
///
/// Stage order: capture the serial number, compatibility checks, erase the
/// image then the header region, verify both erased, program the image
/// then the header, verify the image, reboot, rediscover by serial,
/// confirm the reported version. The first failing stage aborts the run;
/// nothing is retried, because the flash state after a failed erase or
/// write is unknown. A new run (from the compatibility checks) is the only
/// recovery path.
pub fn upgrade<E, P>(
    image: FirmwareImage,
    link: E::Link,
    enumerator: &mut E,
    config: &UpgradeConfig,
    progress: &mut P,
) -> Result<UpgradeOutcome>
where
    E: Enumerator,
    P: UpgradeProgress + ?Sized,
{
    let mut link = link;
    let serial = link.read(regs::SERIAL_NUMBER)?;
    log::info!(
        "device {serial}: installing firmware {}",
        image.declared_version
    );

    image.check_compatibility()?;

    progress.erasing(t7::IMAGE_REGION.name, t7::IMAGE_REGION.pages);
    flash::erase_region(&mut link, &t7::IMAGE_REGION)?;
    progress.erasing(t7::HEADER_REGION.name, t7::HEADER_REGION.pages);
    flash::erase_region(&mut link, &t7::HEADER_REGION)?;

    progress.checking_erase(t7::HEADER_REGION.size_words() + t7::IMAGE_REGION.size_words());
    flash::check_erased(&mut link, &t7::HEADER_REGION)?;
    flash::check_erased(&mut link, &t7::IMAGE_REGION)?;

    write_image(&mut link, &image, progress)?;
    write_header(&mut link, &image, progress)?;
    verify_image(&mut link, &image, progress)?;

    progress.rebooting();
    request_upgrade_reboot(link)?;

    let mut link = wait_for_reenumeration(enumerator, serial, config, progress)?;
    confirm_version(&mut link, image.declared_version)?;
    link.close()?;

    let outcome = UpgradeOutcome {
        serial,
        version: image.declared_version,
    };
    progress.complete(&outcome);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{DeviceInfo, Frame};
    use crate::t7::{Register, IMAGE_HEADER_LEN};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        SerialRead,
        PageErased(u32),
        RebootRequested,
        Closed,
        Reopened,
        VersionRead,
    }

    /// Shared state of a simulated T7: sparse flash contents (absent words
    /// read as erased), identity, and a log of notable events.
    #[derive(Debug)]
    struct SimState {
        flash: HashMap<u32, u32>,
        serial: u32,
        version: f32,
        rebooted: bool,
        /// Scans the device stays invisible for after the reboot.
        scans_until_visible: u32,
        /// Forces the post-reboot version instead of deriving it from the
        /// header that was flashed.
        version_override: Option<f32>,
        events: Vec<Event>,
    }

    impl SimState {
        fn new(serial: u32, version: f32) -> Rc<RefCell<Self>> {
            Rc::new(RefCell::new(Self {
                flash: HashMap::new(),
                serial,
                version,
                rebooted: false,
                scans_until_visible: 1,
                version_override: None,
                events: Vec::new(),
            }))
        }

        fn peek(&self, address: u32) -> u32 {
            *self.flash.get(&address).unwrap_or(&t7::ERASED_WORD)
        }

        /// The version the device reports: before the reboot the original
        /// one, afterwards the one in the freshly flashed header.
        fn reported_version(&self) -> f32 {
            if !self.rebooted {
                return self.version;
            }
            if let Some(v) = self.version_override {
                return v;
            }
            f32::from_bits(self.peek(t7::HEADER_REGION.base + 8))
        }
    }

    #[derive(Debug)]
    struct SimLink {
        state: Rc<RefCell<SimState>>,
        read_cursor: u32,
        write_cursor: u32,
    }

    impl SimLink {
        fn new(state: Rc<RefCell<SimState>>) -> Self {
            Self {
                state,
                read_cursor: 0,
                write_cursor: 0,
            }
        }
    }

    impl DeviceLink for SimLink {
        fn write(&mut self, reg: Register, value: u32) -> Result<()> {
            if reg == regs::REQ_FWUPG && value == t7::REBOOT_KEY {
                let mut state = self.state.borrow_mut();
                state.rebooted = true;
                state.events.push(Event::RebootRequested);
            }
            Ok(())
        }

        fn write_many(&mut self, registers: &[Register], values: &[u32]) -> Result<()> {
            let mut state = self.state.borrow_mut();
            for (reg, &value) in registers.iter().zip(values) {
                if *reg == regs::EXF_ERASE {
                    for offset in (0..t7::FLASH_PAGE_SIZE).step_by(4) {
                        state.flash.remove(&(value + offset));
                    }
                    state.events.push(Event::PageErased(value));
                }
            }
            Ok(())
        }

        fn rw_many(&mut self, frames: &[Frame<'_>]) -> Result<Vec<u32>> {
            let mut state = self.state.borrow_mut();
            let mut out = Vec::new();
            for frame in frames {
                match *frame {
                    Frame::Write { reg, values } => match reg {
                        regs::EXF_P_READ => self.read_cursor = values[0],
                        regs::EXF_P_WRITE => self.write_cursor = values[0],
                        regs::EXF_WRITE => {
                            for &value in values {
                                state.flash.insert(self.write_cursor, value);
                                self.write_cursor += 4;
                            }
                        }
                        _ => {}
                    },
                    Frame::Read { count, .. } => {
                        for _ in 0..count {
                            out.push(state.peek(self.read_cursor));
                            self.read_cursor += 4;
                        }
                    }
                }
            }
            Ok(out)
        }

        fn read(&mut self, reg: Register) -> Result<u32> {
            let mut state = self.state.borrow_mut();
            match reg {
                regs::SERIAL_NUMBER => {
                    state.events.push(Event::SerialRead);
                    Ok(state.serial)
                }
                regs::FIRMWARE_VERSION => {
                    state.events.push(Event::VersionRead);
                    Ok(state.reported_version().to_bits())
                }
                other => panic!("unexpected register read: {}", other.name),
            }
        }

        fn close(self) -> Result<()> {
            self.state.borrow_mut().events.push(Event::Closed);
            Ok(())
        }
    }

    struct SimEnumerator {
        state: Rc<RefCell<SimState>>,
    }

    impl Enumerator for SimEnumerator {
        type Link = SimLink;

        fn list_all(&mut self) -> Result<Vec<DeviceInfo>> {
            let mut state = self.state.borrow_mut();
            if state.scans_until_visible > 0 {
                state.scans_until_visible -= 1;
                return Ok(Vec::new());
            }
            let info = DeviceInfo {
                serial: state.serial,
                product_id: 7.0,
                firmware_version: FirmwareVersion::from_f32(state.reported_version()),
                connection: "sim".to_string(),
            };
            Ok(vec![info])
        }

        fn open(&mut self, serial: u32) -> Result<SimLink> {
            let mut state = self.state.borrow_mut();
            assert_eq!(serial, state.serial);
            state.events.push(Event::Reopened);
            drop(state);
            Ok(SimLink::new(self.state.clone()))
        }
    }

    fn test_image(contained: f32, declared_field: &str, payload_words: usize) -> FirmwareImage {
        let mut bytes = vec![0u8; IMAGE_HEADER_LEN];
        bytes[..4].copy_from_slice(&t7::HEADER_CODE.to_be_bytes());
        bytes[4..8].copy_from_slice(&t7::TARGET_T7.to_be_bytes());
        bytes[8..12].copy_from_slice(&contained.to_be_bytes());
        bytes[24..28].copy_from_slice(&((payload_words * 4) as u32).to_be_bytes());
        for i in 0..payload_words {
            bytes.extend(((i as u32).wrapping_mul(0x0101_0103) ^ 0x5A5A_5A5A).to_be_bytes());
        }
        let name = format!("T7firmware_{declared_field}_2024-11-02.bin");
        FirmwareImage::from_parts(&name, &bytes).unwrap()
    }

    fn fast_config() -> UpgradeConfig {
        UpgradeConfig {
            enumeration_grace: Duration::from_millis(1),
            enumeration_timeout: Some(Duration::from_secs(2)),
        }
    }

    #[test]
    fn header_write_lands_in_the_header_region() {
        let state = SimState::new(470_010_123, 1.0023);
        let mut link = SimLink::new(state.clone());
        let image = test_image(1.0067, "010067", 8);

        write_header(&mut link, &image, &mut NoProgress).unwrap();

        let state = state.borrow();
        let words = image.header_as_words();
        assert_eq!(words.len(), 32);
        for (i, &word) in words.iter().enumerate() {
            assert_eq!(state.peek(t7::HEADER_REGION.base + (i as u32) * 4), word);
        }
    }

    #[test]
    fn image_write_then_verify_is_identity() {
        let state = SimState::new(470_010_123, 1.0023);
        let mut link = SimLink::new(state);
        let image = test_image(1.0067, "010067", 300);

        write_image(&mut link, &image, &mut NoProgress).unwrap();
        verify_image(&mut link, &image, &mut NoProgress).unwrap();
    }

    #[test]
    fn verify_reports_first_mismatching_word() {
        let state = SimState::new(470_010_123, 1.0023);
        let mut link = SimLink::new(state.clone());
        let mut image = test_image(1.0067, "010067", 32);
        // Make word 17 distinctive, then corrupt it in flash.
        let mut bytes = image.header_bytes().to_vec();
        bytes.extend_from_slice(image.image_bytes());
        bytes[IMAGE_HEADER_LEN + 17 * 4..IMAGE_HEADER_LEN + 18 * 4]
            .copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        image = FirmwareImage::from_parts("T7firmware_010067_x.bin", &bytes).unwrap();

        write_image(&mut link, &image, &mut NoProgress).unwrap();
        state
            .borrow_mut()
            .flash
            .insert(t7::IMAGE_REGION.base + 17 * 4, 0xCAFE_BABE);

        let err = verify_image(&mut link, &image, &mut NoProgress).unwrap_err();
        assert!(matches!(
            err,
            Error::WriteVerifyMismatch {
                index: 17,
                expected: 0xDEAD_BEEF,
                actual: 0xCAFE_BABE,
            }
        ));
    }

    #[test]
    fn pipeline_installs_and_confirms_new_firmware() {
        let state = SimState::new(470_010_123, 1.0023);
        {
            // Stale contents from the previous firmware.
            let mut s = state.borrow_mut();
            s.flash.insert(t7::IMAGE_REGION.base, 0x0BAD_F00D);
            s.flash.insert(t7::HEADER_REGION.base + 64, 0x0BAD_F00D);
            s.scans_until_visible = 2;
        }
        let image = test_image(1.0067, "010067", 64);
        let link = SimLink::new(state.clone());
        let mut enumerator = SimEnumerator {
            state: state.clone(),
        };

        let outcome = upgrade(
            image.clone(),
            link,
            &mut enumerator,
            &fast_config(),
            &mut NoProgress,
        )
        .unwrap();

        assert_eq!(outcome.serial, 470_010_123);
        assert_eq!(outcome.version, FirmwareVersion::from_scaled(10067));

        let state = state.borrow();
        // Image and header are in flash.
        for (i, &word) in image.image_as_words().iter().enumerate() {
            assert_eq!(state.peek(t7::IMAGE_REGION.base + (i as u32) * 4), word);
        }
        for (i, &word) in image.header_as_words().iter().enumerate() {
            assert_eq!(state.peek(t7::HEADER_REGION.base + (i as u32) * 4), word);
        }

        // Every page of both regions was erased.
        let erased = state
            .events
            .iter()
            .filter(|e| matches!(e, Event::PageErased(_)))
            .count();
        assert_eq!(
            erased,
            (t7::IMAGE_REGION.pages + t7::HEADER_REGION.pages) as usize
        );

        // The link was closed before the device was reopened, and the
        // version was read on the fresh link.
        let order: Vec<Event> = state
            .events
            .iter()
            .copied()
            .filter(|e| {
                matches!(
                    e,
                    Event::RebootRequested | Event::Closed | Event::Reopened | Event::VersionRead
                )
            })
            .collect();
        assert_eq!(
            order,
            vec![
                Event::RebootRequested,
                Event::Closed,
                Event::Reopened,
                Event::VersionRead,
                // the success path closes the reopened link too
                Event::Closed,
            ]
        );
    }

    #[test]
    fn incompatible_image_aborts_before_any_flash_traffic() {
        let state = SimState::new(470_010_123, 1.0023);
        // Header claims 1.0068, file name claims 1.0067.
        let image = test_image(1.0068, "010067", 16);
        let link = SimLink::new(state.clone());
        let mut enumerator = SimEnumerator {
            state: state.clone(),
        };

        let err = upgrade(
            image,
            link,
            &mut enumerator,
            &fast_config(),
            &mut NoProgress,
        )
        .unwrap_err();

        assert!(matches!(err, Error::IncorrectVersion { .. }));
        let state = state.borrow();
        assert_eq!(state.events, vec![Event::SerialRead]);
        assert!(state.flash.is_empty());
    }

    #[test]
    fn wrong_reported_version_after_reboot_fails() {
        let state = SimState::new(470_010_123, 1.0023);
        state.borrow_mut().version_override = Some(1.0068);
        let image = test_image(1.0067, "010067", 16);
        let link = SimLink::new(state.clone());
        let mut enumerator = SimEnumerator {
            state: state.clone(),
        };

        let err = upgrade(
            image,
            link,
            &mut enumerator,
            &fast_config(),
            &mut NoProgress,
        )
        .unwrap_err();

        match err {
            Error::VersionMismatch { expected, actual } => {
                assert_eq!(expected, FirmwareVersion::from_scaled(10067));
                assert_eq!(actual, FirmwareVersion::from_scaled(10068));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rediscovery_times_out_when_the_device_never_returns() {
        let state = SimState::new(470_010_123, 1.0023);
        state.borrow_mut().scans_until_visible = u32::MAX;
        let mut enumerator = SimEnumerator {
            state: state.clone(),
        };
        let config = UpgradeConfig {
            enumeration_grace: Duration::from_millis(1),
            enumeration_timeout: Some(Duration::from_millis(20)),
        };

        let err =
            wait_for_reenumeration(&mut enumerator, 470_010_123, &config, &mut NoProgress)
                .unwrap_err();
        assert!(matches!(
            err,
            Error::EnumerationTimeout {
                serial: 470_010_123,
                ..
            }
        ));
    }

    #[test]
    fn rediscovery_waits_out_the_invisible_window() {
        let state = SimState::new(470_010_123, 1.0023);
        {
            let mut s = state.borrow_mut();
            s.rebooted = true;
            s.scans_until_visible = 3;
        }
        let mut enumerator = SimEnumerator {
            state: state.clone(),
        };

        let mut link =
            wait_for_reenumeration(&mut enumerator, 470_010_123, &fast_config(), &mut NoProgress)
                .unwrap();
        assert_eq!(link.read(regs::SERIAL_NUMBER).unwrap(), 470_010_123);
    }
}

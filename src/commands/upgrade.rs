//! Upgrade command implementation

use std::path::Path;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use t7flash_core::image::FirmwareImage;
use t7flash_core::link::Enumerator;
use t7flash_core::t7;
use t7flash_core::upgrade::{self, UpgradeConfig, UpgradeOutcome, UpgradeProgress};
use t7flash_modbus::TcpEnumerator;

/// Progress reporter using indicatif progress bars
struct IndicatifProgress {
    multi: MultiProgress,
    current_bar: Option<ProgressBar>,
}

impl IndicatifProgress {
    fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            current_bar: None,
        }
    }

    fn create_bar(&mut self, total: u64, phase: &'static str) {
        self.finish("");
        let pb = self.multi.add(ProgressBar::new(total));
        pb.set_style(
            ProgressStyle::default_bar()
                .template(&format!(
                    "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} words ({{eta}}) {}",
                    phase
                ))
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        self.current_bar = Some(pb);
    }

    fn create_spinner(&mut self, message: String) {
        self.finish("");
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(100));
        self.current_bar = Some(pb);
    }

    fn finish(&mut self, message: &'static str) {
        if let Some(pb) = self.current_bar.take() {
            if message.is_empty() {
                pb.finish_and_clear();
            } else {
                pb.finish_with_message(message);
            }
        }
    }
}

impl UpgradeProgress for IndicatifProgress {
    fn erasing(&mut self, region: &'static str, pages: u32) {
        self.create_spinner(format!("Erasing {} region ({} pages)...", region, pages));
    }

    fn checking_erase(&mut self, total_words: usize) {
        self.create_spinner(format!("Verifying erase ({} words)...", total_words));
    }

    fn writing(&mut self, region: &'static str, total_words: usize) {
        if region == t7::IMAGE_REGION.name {
            self.create_bar(total_words as u64, "Writing");
        } else {
            self.create_spinner(format!("Writing {}...", region));
        }
    }

    fn write_progress(&mut self, words_done: usize) {
        if let Some(pb) = &self.current_bar {
            pb.set_position(words_done as u64);
        }
    }

    fn verifying(&mut self, total_words: usize) {
        self.create_bar(total_words as u64, "Verifying");
    }

    fn verify_progress(&mut self, words_done: usize) {
        if let Some(pb) = &self.current_bar {
            pb.set_position(words_done as u64);
        }
    }

    fn rebooting(&mut self) {
        self.create_spinner("Rebooting device into new firmware...".to_string());
    }

    fn waiting(&mut self, attempt: u32) {
        if let Some(pb) = &self.current_bar {
            pb.set_message(format!("Waiting for device to re-enumerate (scan {})...", attempt));
        }
    }

    fn complete(&mut self, _outcome: &UpgradeOutcome) {
        self.finish("Upgrade complete");
    }
}

/// Run the upgrade command
pub fn run_upgrade(
    file: &Path,
    hosts: Vec<String>,
    serial: Option<u32>,
    grace: u64,
    wait_timeout: u64,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let image = FirmwareImage::load(file)?;
    println!(
        "Firmware: {} (version {}, {} bytes)",
        file.display(),
        image.declared_version,
        image.image_bytes().len()
    );

    image.check_compatibility()?;
    if dry_run {
        println!("Image is installable on a T7; stopping before any device access (--dry-run).");
        return Ok(());
    }

    let mut enumerator = TcpEnumerator::new(hosts);
    let devices = enumerator.list_all()?;

    let target = match serial {
        Some(wanted) => devices
            .iter()
            .find(|d| d.serial == wanted)
            .ok_or_else(|| format!("no device with serial {} found", wanted))?,
        None => match devices.as_slice() {
            [] => return Err("no T7 devices found on the given hosts".into()),
            [only] => only,
            _ => {
                return Err(format!(
                    "{} devices found; select one with --serial",
                    devices.len()
                )
                .into())
            }
        },
    };
    println!(
        "Found: T7 serial {} at {} (running firmware {})",
        target.serial, target.connection, target.firmware_version
    );

    if target.firmware_version == image.declared_version {
        println!("Device already runs {}; reinstalling.", image.declared_version);
    }

    let config = UpgradeConfig {
        enumeration_grace: Duration::from_secs(grace),
        enumeration_timeout: (wait_timeout > 0).then(|| Duration::from_secs(wait_timeout)),
    };

    let link = enumerator.open(target.serial)?;

    let mut progress = IndicatifProgress::new();
    let outcome = upgrade::upgrade(image, link, &mut enumerator, &config, &mut progress)?;

    println!(
        "Device {} is now running firmware {}",
        outcome.serial, outcome.version
    );

    Ok(())
}

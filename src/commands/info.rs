//! Info command implementation

use std::path::Path;

use t7flash_core::image::FirmwareImage;
use t7flash_core::t7;

/// Run the info command: parse a firmware file and print its header.
pub fn run_info(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let image = FirmwareImage::load(file)?;
    let header = &image.header;

    println!("Firmware Image Information");
    println!("==========================");
    println!();
    println!("File:              {}", file.display());
    println!("Declared version:  {}", image.declared_version);
    println!();
    println!("Header code:       0x{:08X}", header.header_code);
    println!(
        "Intended device:   0x{:08X}{}",
        header.intended_device,
        match header.intended_device {
            t7::TARGET_T7 => " (T7)",
            t7::TARGET_T7_LEGACY => " (T7, legacy tag)",
            _ => " (not a T7)",
        }
    );
    println!("Contained version: {}", header.contained_version());
    println!(
        "Requires upgrader: {}",
        header.required_upgrader_version()
    );
    println!();
    println!(
        "Image:             {} of {} in file",
        header.image_number, header.num_images
    );
    println!(
        "Image payload:     {} bytes at offset {}",
        header.image_length, header.image_offset
    );
    if header.num_images > 1 {
        println!("Next image at:     {}", header.next_image_offset);
    }
    println!("SHA region:        {} bytes", header.sha_byte_count);
    println!("Options:           0x{:08X}", header.options);
    println!("Header checksum:   0x{:08X}", header.checksum);
    println!();

    match image.check_compatibility() {
        Ok(()) => println!("Image is installable on a T7."),
        Err(e) => println!("Image is NOT installable: {e}"),
    }

    Ok(())
}

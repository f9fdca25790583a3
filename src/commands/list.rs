//! List command implementation

use t7flash_core::link::Enumerator;
use t7flash_modbus::TcpEnumerator;

/// Run the list command: probe the given hosts and print every T7 found.
pub fn run_list(hosts: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let mut enumerator = TcpEnumerator::new(hosts);
    let devices = enumerator.list_all()?;

    if devices.is_empty() {
        println!("No T7 devices found.");
        return Ok(());
    }

    println!("{:<12} {:>10} {:<22}", "Serial", "Firmware", "Address");
    println!("{}", "-".repeat(46));
    for device in &devices {
        println!(
            "{:<12} {:>10} {:<22}",
            device.serial,
            device.firmware_version.to_string(),
            device.connection
        );
    }

    Ok(())
}
